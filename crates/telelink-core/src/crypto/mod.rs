//! Payload encryption.
//!
//! [`CryptoBox`] frames plaintext the way the server expects (random filler
//! prefix, zero padding, fresh IV) and delegates the block transform to a
//! [`PayloadCipher`].  The default cipher is XTEA in CBC mode with a 16-byte
//! key; Blowfish-CBC can be selected per connection with [`CipherKind`].

mod cipher;

pub use cipher::{
    BlowfishCbc, CipherKind, CryptoBox, CryptoError, PayloadCipher, Sealed, XteaCbc, FILLER_LEN,
};
