use std::net::SocketAddr;
use std::sync::Arc;

use portcullis::authz::{FieldAccess, FieldPermissions, Operation, Permission, Scope};
use portcullis::jwks::KeyManager;
use portcullis::settings::Settings;
use portcullis::storage::{hash_password, BackingStore, MemoryStore, Principal, Role};
use portcullis::web::{self, AppState};

pub const PASSWORD: &str = "correct horse battery staple";

/// Router served on an ephemeral port, backed by the given store
pub struct TestServer {
    pub base_url: String,
    pub state: AppState,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    pub async fn start(store: Arc<dyn BackingStore>, configure: impl FnOnce(&mut Settings)) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind test listener");
        let addr = listener.local_addr().expect("No local addr");

        let mut settings = Settings::default();
        settings.server.host = "127.0.0.1".into();
        settings.server.port = addr.port();
        configure(&mut settings);

        let keys = Arc::new(KeyManager::generate(&settings.keys.alg).expect("Failed to generate keys"));
        let state = AppState::build(settings, store, keys)
            .await
            .expect("Failed to build app state");

        let app = web::router(state.clone()).into_make_service_with_connect_info::<SocketAddr>();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("Test server failed");
        });

        Self {
            base_url: format!("http://{addr}"),
            state,
            handle,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// ANALYST (20) reads departmental reports without salary; ADMIN (90) manages grants.
pub async fn seed(store: &dyn BackingStore) {
    let hash = hash_password(PASSWORD).expect("Failed to hash password");

    store.upsert_role(&Role::new("ANALYST", 20)).await.unwrap();
    store.upsert_role(&Role::new("ADMIN", 90)).await.unwrap();

    store
        .upsert_permission(
            "ANALYST",
            &Permission::new("report-read-dept", "Report", Operation::Read, Scope::Department)
                .with_fields(FieldPermissions::from_entries([("salary", FieldAccess::Deny)])),
        )
        .await
        .unwrap();
    for (id, op) in [
        ("grant-create", Operation::Create),
        ("grant-read", Operation::Read),
        ("grant-delete", Operation::Delete),
    ] {
        store
            .upsert_permission("ADMIN", &Permission::new(id, "Permission", op, Scope::All))
            .await
            .unwrap();
    }

    store
        .upsert_principal(
            &Principal::new("u-alice", "alice", "ANALYST")
                .with_department("Finance")
                .with_password_hash(hash.clone()),
        )
        .await
        .unwrap();
    store
        .upsert_principal(&Principal::new("u-root", "root", "ADMIN").with_password_hash(hash))
        .await
        .unwrap();
}

pub async fn seeded_memory_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    seed(store.as_ref()).await;
    store
}
