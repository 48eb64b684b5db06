//! Two users in one chat room over the in-memory change-stream.
//!
//! Run with `RUST_LOG=debug` to follow the channel lifecycle.

use std::sync::Arc;
use std::time::Duration;

use syncline::prelude::*;
use syncline_mem::{InMemoryChangeStream, InMemoryPageStore, InMemoryQueryCache, InMemorySessionProvider};
use uuid::Uuid;

fn context(stream: &InMemoryChangeStream, pages: &InMemoryPageStore, user: &Identity) -> SyncContext {
    SyncContext::new(
        Arc::new(stream.clone()),
        Arc::new(InMemorySessionProvider::signed_in(user.user_id)),
        Arc::new(pages.clone()),
        Arc::new(InMemoryQueryCache::new()),
        RealtimeConfig::default(),
    )
}

async fn wait_until_subscribed(room: &ChatRoomSync) {
    if let Some(mut state) = room.watch_state().await {
        let _ = state.wait_for(|s| *s == ConnectionState::Subscribed).await;
    }
}

fn print_room(name: &str, room: &ChatRoomSync) {
    println!("--- {} sees ---", name);
    for message in room.messages() {
        let marker = if message.is_speculative() { " (sending)" } else { "" };
        println!("{}: {}{}", message.sender_name, message.content, marker);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let stream = InMemoryChangeStream::new();
    let pages = InMemoryPageStore::new();
    stream.enable_echo(Some(pages.clone()));

    let ada = Identity::new(Uuid::new_v4(), "ada");
    let bob = Identity::new(Uuid::new_v4(), "bob");
    let ada_ctx = context(&stream, &pages, &ada);
    let bob_ctx = context(&stream, &pages, &bob);

    let ada_room = ChatRoomSync::mount(&ada_ctx, "lobby", ada.clone()).await?;
    let bob_room = ChatRoomSync::mount(&bob_ctx, "lobby", bob.clone()).await?;
    wait_until_subscribed(&ada_room).await;
    wait_until_subscribed(&bob_room).await;

    ada_room.typing().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    println!("bob sees typing: {:?}", bob_room.typing_users());

    ada_room.send_message("hi bob").await?;
    print_room("ada", &ada_room);

    bob_room.send_message("hey ada").await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    print_room("ada", &ada_room);
    print_room("bob", &bob_room);

    stream.set_online(false);
    match bob_room.send_message("are you there?").await {
        Ok(_) => println!("unexpectedly delivered"),
        Err(e) => println!("bob's send failed and was rolled back: {}", e),
    }
    stream.set_online(true);
    print_room("bob", &bob_room);

    ada_room.unmount().await;
    bob_room.unmount().await;
    println!("broadcasts sent: {}", stream.broadcasts().len());
    Ok(())
}
