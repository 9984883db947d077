pub mod permission;
pub mod principal;
pub mod role;
pub mod role_permission;
pub mod session;

pub use permission::Entity as Permission;
pub use principal::Entity as Principal;
pub use role::Entity as Role;
pub use role_permission::Entity as RolePermission;
pub use session::Entity as Session;
