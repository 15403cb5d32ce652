//! # Messaging Demo
//!
//! Walks through a first conversation between two users:
//! 1. Both users sign in; each vault provisions a keypair
//! 2. Alice opens a conversation with Bob and sends a message
//! 3. Bob reads the history and watches a live reply arrive
//! 4. The store only ever held ciphertext
//!
//! ## Run
//!
//! ```bash
//! RUST_LOG=parley_core=debug cargo run --example messaging_demo
//! ```

use std::sync::Arc;
use std::time::Duration;

use parley_core::storage::Backend;
use parley_core::{
    ConnectivityFlag, KdfParams, KeyVault, MemoryBackend, MessagingConfig, MessagingSession, Outbox,
    SessionCredentials,
};
use tracing_subscriber::EnvFilter;

async fn sign_in(
    backend: &Arc<dyn Backend>,
    config: &MessagingConfig,
    user_id: &str,
    token: &str,
) -> MessagingSession {
    let vault = Arc::new(KeyVault::new(Arc::clone(backend), config.clone()));
    vault
        .activate(&SessionCredentials::new(user_id, token))
        .await
        .expect("vault activation failed");

    MessagingSession::new(
        Arc::clone(backend),
        vault,
        Arc::new(ConnectivityFlag::new(true)),
        Arc::new(Outbox::in_memory(config)),
        config.clone(),
    )
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("=================================================");
    println!("            PARLEY MESSAGING DEMO");
    println!("=================================================\n");

    // Cheap KDF settings keep the demo fast; production uses the defaults.
    let config = MessagingConfig {
        kdf: KdfParams {
            memory_kib: 1024,
            iterations: 1,
            parallelism: 1,
        },
        ..MessagingConfig::default()
    };
    let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::default());

    // =========================================================================
    // STEP 1: Sign in
    // =========================================================================
    println!("1. Signing in Alice and Bob...\n");

    let alice = sign_in(&backend, &config, "alice", "alice-session-token-0123456789abcdef").await;
    let bob = sign_in(&backend, &config, "bob", "bob-session-token-fedcba9876543210").await;

    for session in [&alice, &bob] {
        let vault = session.vault();
        if let Some(keypair) = vault.keypair() {
            println!(
                "   {:<6} key fingerprint: {}",
                vault.user_id().unwrap_or_default(),
                vault.codec().fingerprint(keypair.public_key())
            );
        }
    }
    println!();

    // =========================================================================
    // STEP 2: First message
    // =========================================================================
    println!("2. Alice sends the first message...\n");

    let conversation_id = alice
        .get_or_create_conversation("bob")
        .await
        .expect("conversation");
    let outcome = alice
        .send_message(&conversation_id, "Hey Bob, this is encrypted!", "bob")
        .await
        .expect("send");
    println!("   Sent {} ({})", outcome.entry().id, outcome.entry().content);
    println!();

    // =========================================================================
    // STEP 3: Bob reads and listens
    // =========================================================================
    println!("3. Bob opens the conversation...\n");

    let mut view = bob.open_conversation(&conversation_id).await.expect("open");
    for entry in view.messages() {
        println!("   [{}] {}", entry.sender_id, entry.content);
    }

    let mut updates = view.updates();
    alice
        .send_message(&conversation_id, "Still there?", "bob")
        .await
        .expect("send");
    if let Ok(Ok(entry)) = tokio::time::timeout(Duration::from_secs(1), updates.recv()).await {
        println!("   [{}] {} (live)", entry.sender_id, entry.content);
    }
    view.close().await;
    println!();

    // =========================================================================
    // STEP 4: What the store holds
    // =========================================================================
    println!("4. Stored envelopes (ciphertext only)...\n");

    for envelope in backend.list_messages(&conversation_id).await.expect("list") {
        println!(
            "   {} content={}... nonce={}",
            envelope.id,
            &envelope.encrypted_content[..envelope.encrypted_content.len().min(24)],
            envelope.nonce
        );
    }

    println!("\n=================================================");
    println!("                 DEMO COMPLETE");
    println!("=================================================");
}
