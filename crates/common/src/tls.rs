/// Install the rustls `ring` crypto provider for `wss://` and `https://` connections.
///
/// Safe to call repeatedly; only the first call has an effect.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}
