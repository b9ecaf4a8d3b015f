use iroh::SecretKey;

/// Fresh identity for one session.
///
/// Keys are never persisted: every run gets a new endpoint id, so an old
/// share link cannot reach a later session.
pub fn generate_session_key() -> SecretKey {
    SecretKey::generate(&mut rand::rng())
}
