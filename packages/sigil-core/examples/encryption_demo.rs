//! # Encryption Demo
//!
//! Wraps a conversation key for a recipient with each supported algorithm,
//! then seals and opens a message under it.
//!
//! ## Run
//!
//! ```bash
//! cargo run --example encryption_demo
//! ```

use rand::RngCore;
use sigil_core::crypto::{
    decrypt, encrypt, unwrap_key, wrap_key, Algorithm, EncryptionKey, KeyPairService,
};

fn main() {
    println!("=== Sigil Core: Key Wrapping Demo ===\n");

    println!("  ┌─────────────────────────────────────────────────────────────┐");
    println!("  │                    KEY WRAPPING FLOW                        │");
    println!("  ├─────────────────────────────────────────────────────────────┤");
    println!("  │                                                             │");
    println!("  │   Sender                              Recipient device      │");
    println!("  │     │                                  │                    │");
    println!("  │     │◄──── public KEM bundle ──────────│                    │");
    println!("  │     │                                  │                    │");
    println!("  │  encapsulate ──► shared secret         │                    │");
    println!("  │  AEAD(shared, conversation key)        │                    │");
    println!("  │     │                                  │                    │");
    println!("  │     │──── KEM ciphertext + sealed key ►│                    │");
    println!("  │     │                                  ▼                    │");
    println!("  │     │                    decapsulate ──► shared secret      │");
    println!("  │     │                    AEAD open   ──► conversation key   │");
    println!("  │                                                             │");
    println!("  └─────────────────────────────────────────────────────────────┘");
    println!();

    let service = KeyPairService::new();
    let context = b"demo-conversation|1|recipient";

    for algorithm in Algorithm::ALL {
        println!("{} ({})", algorithm, algorithm.family());

        let recipient = service
            .generate_key_pair(algorithm)
            .expect("Failed to generate recipient keys");

        let mut conversation_key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut conversation_key);

        let wrapped = wrap_key(&service, &recipient.public, algorithm, &conversation_key, context)
            .expect("Failed to wrap key");
        let kyber_bytes = wrapped.kem_ciphertext.kyber.as_ref().map_or(0, |k| k.len());
        println!(
            "  wrapped: {} byte sealed key, {} byte Kyber ciphertext, X25519 ephemeral: {}",
            wrapped.ciphertext.len(),
            kyber_bytes,
            wrapped.kem_ciphertext.x25519_ephemeral.is_some()
        );

        let unwrapped = unwrap_key(&service, &wrapped, &recipient.private, context)
            .expect("Failed to unwrap key");
        assert_eq!(*unwrapped, conversation_key);

        let wrong_context = unwrap_key(&service, &wrapped, &recipient.private, b"other");
        println!("  unwrap with the wrong context: {:?}", wrong_context.err().map(|e| e.kind()));

        let key = EncryptionKey::from_bytes(*unwrapped);
        let sealed = encrypt(algorithm.aead(), &key, b"Hello, Bob!", b"header")
            .expect("Failed to encrypt");
        let opened = decrypt(
            algorithm.aead(),
            &key,
            &sealed.nonce,
            &sealed.ciphertext,
            &sealed.tag,
            b"header",
        )
        .expect("Failed to decrypt");
        println!(
            "  message: {} ciphertext bytes, tag {}..., opened as {:?}",
            sealed.ciphertext.len(),
            hex::encode(&sealed.tag[..4]),
            String::from_utf8_lossy(&opened)
        );
        println!();
    }

    println!("=== Demo Complete ===");
}
