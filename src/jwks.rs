use crate::errors::AppError;
use crate::settings::Keys;
use base64ct::Encoding;
use josekit::jwk::Jwk;
use josekit::jws::{JwsHeader, JwsSigner, JwsVerifier, RS256, RS384, RS512};
use josekit::jwt;
use josekit::jwt::JwtPayload;
use josekit::JoseError;
use rand::RngCore;
use serde_json::{json, Map, Value};
use std::fs;
use std::path::PathBuf;
use std::sync::{PoisonError, RwLock};

const SUPPORTED_ALGS: [&str; 3] = ["RS256", "RS384", "RS512"];

#[derive(Debug)]
struct KeySet {
    /// Private JWK used for issuing tokens
    signing: Jwk,
    /// Public JWKs accepted for verification, in publication order
    published: Vec<Jwk>,
}

/// Where key material is persisted. `None` keeps everything in memory.
#[derive(Debug, Clone)]
struct KeyPaths {
    jwks: PathBuf,
    private_key: PathBuf,
}

/// Owns the active signing key and the published verification key set.
///
/// Readers take a short read lock and clone what they need; `publish`,
/// `unpublish` and `rotate` are visible to the next verification.
#[derive(Debug)]
pub struct KeyManager {
    alg: String,
    paths: Option<KeyPaths>,
    keys: RwLock<KeySet>,
}

impl KeyManager {
    /// Load the signing key and published set from disk, generating and persisting
    /// whatever is missing.
    pub fn new(cfg: Keys) -> Result<Self, AppError> {
        check_alg(&cfg.alg)?;
        if let Some(parent) = cfg.jwks_path.parent() {
            fs::create_dir_all(parent)?;
        }
        if let Some(parent) = cfg.private_key_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let signing = if cfg.private_key_path.exists() {
            let s = fs::read_to_string(&cfg.private_key_path)?;
            serde_json::from_str::<Jwk>(&s)?
        } else {
            let jwk = generate_key(cfg.key_id.clone(), &cfg.alg)?;
            fs::write(&cfg.private_key_path, serde_json::to_string_pretty(&jwk)?)?;
            tracing::info!(path = %cfg.private_key_path.display(), "Generated new signing key");
            jwk
        };

        let mut published = if cfg.jwks_path.exists() {
            let value: Value = serde_json::from_str(&fs::read_to_string(&cfg.jwks_path)?)?;
            parse_key_set(&value)?
        } else {
            Vec::new()
        };
        let signing_public = public_half(&signing)?;
        if !published.iter().any(|k| k.key_id() == signing_public.key_id()) {
            published.push(signing_public);
        }

        let manager = Self {
            alg: cfg.alg,
            paths: Some(KeyPaths {
                jwks: cfg.jwks_path,
                private_key: cfg.private_key_path,
            }),
            keys: RwLock::new(KeySet { signing, published }),
        };
        manager.persist_published()?;
        tracing::info!(
            kid = manager.active_key_id().as_deref().unwrap_or("-"),
            published = manager.published_count(),
            "Loaded key set"
        );
        Ok(manager)
    }

    /// A manager whose keys live only in memory.
    pub fn generate(alg: &str) -> Result<Self, AppError> {
        check_alg(alg)?;
        let signing = generate_key(None, alg)?;
        let published = vec![public_half(&signing)?];
        Ok(Self {
            alg: alg.to_string(),
            paths: None,
            keys: RwLock::new(KeySet { signing, published }),
        })
    }

    pub fn alg(&self) -> &str {
        &self.alg
    }

    pub fn active_key_id(&self) -> Option<String> {
        self.read().signing.key_id().map(str::to_string)
    }

    pub fn published_count(&self) -> usize {
        self.read().published.len()
    }

    /// `{"keys": [...]}` of the published public keys, projected to the members a
    /// relying party needs.
    pub fn public_key_set(&self) -> Value {
        let keys: Vec<Value> = self.read().published.iter().map(project_public).collect();
        json!({ "keys": keys })
    }

    pub fn published_key(&self, kid: &str) -> Option<Jwk> {
        self.read()
            .published
            .iter()
            .find(|k| k.key_id() == Some(kid))
            .cloned()
    }

    /// Add (or replace, by `kid`) a public RSA key in the published set.
    pub fn publish(&self, jwk: Jwk) -> Result<(), AppError> {
        if jwk.key_type() != "RSA" {
            return Err(AppError::Jose(format!(
                "only RSA keys can be published, got `{}`",
                jwk.key_type()
            )));
        }
        let public = public_half(&jwk)?;
        let Some(kid) = public.key_id().map(str::to_string) else {
            return Err(AppError::Jose("published keys must carry a `kid`".into()));
        };
        {
            let mut keys = self.write();
            keys.published.retain(|k| k.key_id() != Some(kid.as_str()));
            keys.published.push(public);
        }
        self.persist_published()?;
        tracing::info!(kid = %kid, "Published verification key");
        Ok(())
    }

    /// Remove a key from the published set. Returns whether it was present.
    pub fn unpublish(&self, kid: &str) -> Result<bool, AppError> {
        let removed = {
            let mut keys = self.write();
            let before = keys.published.len();
            keys.published.retain(|k| k.key_id() != Some(kid));
            keys.published.len() != before
        };
        if removed {
            self.persist_published()?;
            tracing::info!(kid, "Unpublished verification key");
        }
        Ok(removed)
    }

    /// Replace the signing key. The previous public key stays published until
    /// explicitly unpublished. Returns the new key id.
    pub fn rotate(&self) -> Result<String, AppError> {
        let next = generate_key(None, &self.alg)?;
        let public = public_half(&next)?;
        let kid = next
            .key_id()
            .map(str::to_string)
            .ok_or_else(|| AppError::Jose("generated key has no kid".into()))?;

        if let Some(paths) = &self.paths {
            fs::write(&paths.private_key, serde_json::to_string_pretty(&next)?)?;
        }
        let previous = {
            let mut keys = self.write();
            keys.published.push(public);
            let previous = keys.signing.key_id().map(str::to_string);
            keys.signing = next;
            previous
        };
        self.persist_published()?;
        tracing::info!(kid = %kid, previous = previous.as_deref().unwrap_or("-"), "Rotated signing key");
        Ok(kid)
    }

    pub fn sign(&self, payload: &JwtPayload) -> Result<String, AppError> {
        let signing = self.read().signing.clone();
        let signer = signer_for(&self.alg, &signing)?;
        let mut header = JwsHeader::new();
        if let Some(kid) = signing.key_id() {
            header.set_key_id(kid);
        }
        header.set_token_type("JWT");
        let token = jwt::encode_with_signer(payload, &header, signer.as_ref())?;
        Ok(token)
    }

    fn persist_published(&self) -> Result<(), AppError> {
        let Some(paths) = &self.paths else {
            return Ok(());
        };
        let value = {
            let keys = self.read();
            let keys: Vec<Value> = keys
                .published
                .iter()
                .map(|k| Value::Object(k.as_ref().clone()))
                .collect();
            json!({ "keys": keys })
        };
        fs::write(&paths.jwks, serde_json::to_string_pretty(&value)?)?;
        Ok(())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, KeySet> {
        self.keys.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, KeySet> {
        self.keys.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn check_alg(alg: &str) -> Result<(), AppError> {
    if SUPPORTED_ALGS.contains(&alg) {
        Ok(())
    } else {
        Err(AppError::Jose(format!(
            "unsupported signing algorithm `{alg}` (expected one of {})",
            SUPPORTED_ALGS.join(", ")
        )))
    }
}

fn generate_key(kid: Option<String>, alg: &str) -> Result<Jwk, JoseError> {
    let mut jwk = Jwk::generate_rsa_key(2048)?;
    jwk.set_key_id(kid.unwrap_or_else(random_kid));
    jwk.set_algorithm(alg);
    jwk.set_key_use("sig");
    Ok(jwk)
}

/// Public part of `jwk`. josekit's `to_public_key` keeps only `kty`, `use`, `n`
/// and `e`; the `kid` and `alg` the verifier selects on are carried over here.
fn public_half(jwk: &Jwk) -> Result<Jwk, JoseError> {
    let mut public = jwk.to_public_key()?;
    if let Some(kid) = jwk.key_id() {
        public.set_key_id(kid);
    }
    if let Some(alg) = jwk.algorithm() {
        public.set_algorithm(alg);
    }
    public.set_key_use(jwk.key_use().unwrap_or("sig"));
    Ok(public)
}

fn parse_key_set(value: &Value) -> Result<Vec<Jwk>, AppError> {
    let keys = value
        .get("keys")
        .and_then(Value::as_array)
        .ok_or_else(|| AppError::Jose("key set file has no `keys` array".into()))?;
    keys.iter()
        .map(|k| match k {
            Value::Object(map) => Ok(Jwk::from_map(map.clone())?),
            other => Err(AppError::Jose(format!("key set entry is not an object: {other}"))),
        })
        .collect()
}

fn project_public(jwk: &Jwk) -> Value {
    let mut out = Map::new();
    for member in ["kty", "alg", "use", "kid", "n", "e"] {
        if let Some(v) = jwk.parameter(member) {
            out.insert(member.to_string(), v.clone());
        }
    }
    Value::Object(out)
}

pub(crate) fn signer_for(alg: &str, jwk: &Jwk) -> Result<Box<dyn JwsSigner>, JoseError> {
    Ok(match alg {
        "RS384" => Box::new(RS384.signer_from_jwk(jwk)?),
        "RS512" => Box::new(RS512.signer_from_jwk(jwk)?),
        _ => Box::new(RS256.signer_from_jwk(jwk)?),
    })
}

/// Verifier for a published key. `None` for algorithms outside the RSASSA family.
pub(crate) fn verifier_for(jwk: &Jwk) -> Result<Option<Box<dyn JwsVerifier>>, JoseError> {
    Ok(match jwk.algorithm().unwrap_or("RS256") {
        "RS256" => Some(Box::new(RS256.verifier_from_jwk(jwk)?)),
        "RS384" => Some(Box::new(RS384.verifier_from_jwk(jwk)?)),
        "RS512" => Some(Box::new(RS512.verifier_from_jwk(jwk)?)),
        _ => None,
    })
}

fn random_kid() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64ct::Base64UrlUnpadded::encode_string(&bytes)
}
