pub mod cipher;
pub mod memory_stores;
pub mod prekeys;
mod ratchet;
pub mod session;
pub mod store;

pub use cipher::{Aes256GcmCipher, ChaCha20Poly1305Cipher, MessageCipher, MessageKey};
pub use memory_stores::{MemoryPreKeyStore, MemorySessionStore};
pub use prekeys::{KeyBundleStore, OneTimePreKeyPublic, PreKeyBundle, SignedPreKeyPublic};
pub use session::{CiphertextFrame, PreKeyHeader, Session, SessionEstablisher};
pub use store::{KeyIdCounters, PreKeyStore, SessionStore, SignedPreKeyRecord};
