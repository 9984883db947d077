use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Enable foreign keys for SQLite
        if manager.get_database_backend() == sea_orm::DatabaseBackend::Sqlite {
            manager
                .get_connection()
                .execute_unprepared("PRAGMA foreign_keys = ON")
                .await?;
        }

        manager
            .create_table(
                Table::create()
                    .table(Roles::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Roles::Name)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(integer(Roles::Level))
                    .col(string(Roles::Description))
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Principals::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Principals::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(string_uniq(Principals::Username))
                    .col(string_null(Principals::PasswordHash))
                    .col(string(Principals::Role))
                    .col(string_null(Principals::Department))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_principals_role")
                            .from(Principals::Table, Principals::Role)
                            .to(Roles::Table, Roles::Name),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Permissions::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Permissions::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(string(Permissions::ResourceType))
                    .col(string(Permissions::Operation))
                    .col(string(Permissions::Scope))
                    // JSON object field -> access, NULL when unrestricted
                    .col(text_null(Permissions::FieldPermissions))
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(RolePermissions::Table)
                    .if_not_exists()
                    .col(string(RolePermissions::RoleName))
                    .col(string(RolePermissions::PermissionId))
                    .primary_key(
                        Index::create()
                            .col(RolePermissions::RoleName)
                            .col(RolePermissions::PermissionId),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_role_permissions_role")
                            .from(RolePermissions::Table, RolePermissions::RoleName)
                            .to(Roles::Table, Roles::Name)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_role_permissions_permission")
                            .from(RolePermissions::Table, RolePermissions::PermissionId)
                            .to(Permissions::Table, Permissions::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Sessions::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Sessions::Handle)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(string(Sessions::PrincipalId))
                    .col(text(Sessions::Payload))
                    .col(big_integer(Sessions::CreatedAt))
                    .col(big_integer(Sessions::LastAccessedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_sessions_last_accessed_at")
                    .table(Sessions::Table)
                    .col(Sessions::LastAccessedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Sessions::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(RolePermissions::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Permissions::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Principals::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Roles::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(DeriveIden)]
enum Roles {
    Table,
    Name,
    Level,
    Description,
}

#[derive(DeriveIden)]
enum Principals {
    Table,
    Id,
    Username,
    PasswordHash,
    Role,
    Department,
}

#[derive(DeriveIden)]
enum Permissions {
    Table,
    Id,
    ResourceType,
    Operation,
    Scope,
    FieldPermissions,
}

#[derive(DeriveIden)]
enum RolePermissions {
    Table,
    RoleName,
    PermissionId,
}

#[derive(DeriveIden)]
enum Sessions {
    Table,
    Handle,
    PrincipalId,
    Payload,
    CreatedAt,
    LastAccessedAt,
}
