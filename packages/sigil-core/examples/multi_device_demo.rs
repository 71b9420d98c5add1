//! # Multi-Device Demo
//!
//! Alice has a laptop and a phone, Bob has a classical-only phone. The demo
//! sets up a conversation, exchanges messages, revokes Alice's phone and
//! shows that the new key version never reaches it.
//!
//! ## Run
//!
//! ```bash
//! RUST_LOG=sigil_core=info cargo run --example multi_device_demo
//! ```

use std::sync::Arc;

use sigil_core::{
    Algorithm, CapabilitySet, DeviceKind, DeviceProfile, MemoryDirectory, SecureKeyStore,
    SigilConfig, SigilSession, Verification,
};

async fn device(
    user: &str,
    name: &str,
    kind: DeviceKind,
    capabilities: CapabilitySet,
    directory: &Arc<MemoryDirectory>,
) -> SigilSession {
    let config = SigilConfig::fast_kdf();
    let store = SecureKeyStore::in_memory(config.backup.clone());
    SigilSession::bootstrap(
        user,
        DeviceProfile::new(name, kind, capabilities),
        config,
        store,
        directory.clone(),
    )
    .await
    .expect("Failed to bootstrap device")
}

async fn verify(session: &SigilSession, other: &SigilSession) {
    session
        .sync_devices(other.user_id())
        .await
        .expect("Failed to sync devices");
    let fingerprint = other.fingerprint().expect("Missing fingerprint");
    session
        .trust_device(other.device_id(), Some(&Verification::new(fingerprint)))
        .await
        .expect("Failed to trust device");
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("=== Sigil Core: Multi-Device Demo ===\n");
    let directory = Arc::new(MemoryDirectory::new());

    // Step 1: three devices
    println!("Step 1: Bootstrapping devices...");
    let laptop = device("alice", "Laptop", DeviceKind::Desktop, CapabilitySet::all(), &directory).await;
    let phone = device("alice", "Phone", DeviceKind::Mobile, CapabilitySet::all(), &directory).await;
    let bob = device(
        "bob",
        "Phone",
        DeviceKind::Mobile,
        CapabilitySet::new([Algorithm::X25519Aes256Gcm]),
        &directory,
    )
    .await;
    for session in [&laptop, &phone, &bob] {
        println!(
            "  {}/{}  fingerprint {}...",
            session.user_id(),
            session.device_id(),
            &session.fingerprint().expect("Missing fingerprint")[..16]
        );
    }
    println!();

    // Step 2: fingerprints compared out of band
    println!("Step 2: Verifying devices...");
    verify(&laptop, &phone).await;
    verify(&laptop, &bob).await;
    verify(&bob, &laptop).await;
    phone.sync_devices("alice").await.expect("Failed to sync");
    phone.sync_devices("bob").await.expect("Failed to sync");
    println!("  Laptop trusts the phone and Bob; Bob trusts the laptop\n");

    // Step 3: conversation
    println!("Step 3: Setting up the conversation...");
    let participants = vec![
        laptop.device_id().to_string(),
        phone.device_id().to_string(),
        bob.device_id().to_string(),
    ];
    let key = laptop
        .setup_conversation("family", &participants, None)
        .await
        .expect("Failed to set up conversation");
    println!(
        "  version {} negotiated {} for {} devices\n",
        key.version(),
        key.algorithm(),
        key.recipients().len()
    );

    // Step 4: messages
    println!("Step 4: Exchanging messages...");
    let envelope = laptop
        .encrypt("family", b"Dinner at eight?")
        .await
        .expect("Failed to encrypt");
    println!("  wire: {}...", &envelope.to_json().expect("Failed to encode")[..72]);
    for session in [&phone, &bob] {
        let plaintext = session
            .decrypt("family", &envelope)
            .await
            .expect("Failed to decrypt");
        println!("  {} read: {}", session.device_id(), String::from_utf8_lossy(&plaintext));
    }
    let reply = bob.encrypt("family", b"Sure!").await.expect("Failed to encrypt");
    let plaintext = laptop.decrypt("family", &reply).await.expect("Failed to decrypt");
    println!("  laptop read: {}\n", String::from_utf8_lossy(&plaintext));

    // Step 5: revoke the phone
    println!("Step 5: Revoking Alice's phone...");
    let rotated = laptop
        .revoke_device(phone.device_id(), "lost on the train")
        .await
        .expect("Failed to revoke");
    for key in &rotated {
        println!(
            "  {} re-keyed to version {} for {:?}",
            key.secret.conversation_id,
            key.version(),
            key.recipients()
        );
    }
    let envelope = laptop
        .encrypt("family", b"New door code: 4821")
        .await
        .expect("Failed to encrypt");
    match phone.decrypt("family", &envelope).await {
        Ok(_) => println!("  phone could still read. This should not happen"),
        Err(e) => println!("  phone cannot read: {} ({})", e, e.kind().as_str()),
    }
    let plaintext = bob.decrypt("family", &envelope).await.expect("Failed to decrypt");
    println!("  bob read: {}\n", String::from_utf8_lossy(&plaintext));

    // Step 6: audit
    println!("Step 6: Security events on the laptop...");
    for event in laptop.events().all() {
        println!("  {:?}", event.kind);
    }

    println!("\n=== Demo Complete ===");
}
