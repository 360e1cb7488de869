use std::path::Path;

use pbkdf2::pbkdf2_hmac_array;
use sha2::Sha256;
use uuid::Uuid;

use crate::crypto::{KEY_SIZE, PBKDF2_ITERATIONS};

/// Namespace string appended to the fingerprint so auto-derived keys can
/// never collide with another tool's derivation over the same identifiers.
const NAMESPACE: &str = "timelocker-auto-unlock-v1";
/// Fixed salt for the fingerprint KDF. Auto-unlock trades per-installation
/// salting for determinism; the vault stays host-bound because the
/// fingerprint itself is host-specific.
const AUTO_SALT: &[u8] = b"timelocker_auto_salt_v1";

/// Compose the stable system fingerprint: machine id, uid (or username),
/// hostname, and the namespace string, colon-joined.
pub fn system_fingerprint() -> String {
    let mut identifiers = vec![machine_id()];

    match timelocker_config::paths::effective_uid() {
        Some(uid) => identifiers.push(uid.to_string()),
        None => identifiers.push(username()),
    }

    identifiers.push(hostname());
    identifiers.push(NAMESPACE.to_string());
    identifiers.join(":")
}

/// Deterministic per-machine master key for unattended unlock, hex-encoded.
pub fn auto_master_key() -> String {
    let fingerprint = system_fingerprint();
    let key = pbkdf2_hmac_array::<Sha256, KEY_SIZE>(
        fingerprint.as_bytes(),
        AUTO_SALT,
        PBKDF2_ITERATIONS,
    );
    key.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Machine identity: systemd machine-id, then the dbus fallback, then a
/// stable UUIDv5 derived from hostname and user.
fn machine_id() -> String {
    for path in ["/etc/machine-id", "/var/lib/dbus/machine-id"] {
        if let Some(id) = read_id_file(Path::new(path)) {
            return id;
        }
    }
    Uuid::new_v5(
        &Uuid::NAMESPACE_DNS,
        format!("{}.{}", hostname(), username()).as_bytes(),
    )
    .to_string()
}

fn read_id_file(path: &Path) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    let trimmed = content.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn hostname() -> String {
    gethostname::gethostname().to_string_lossy().to_string()
}

fn username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}
