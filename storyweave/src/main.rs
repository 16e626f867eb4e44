use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use storyweave_core::{logging, Config, ParticipantId, StoryId};
use storyweave_realtime::{ChannelRegistry, ChannelSession, LocalHub, SessionCallbacks};

#[derive(Parser, Debug)]
#[command(name = "storyweave")]
#[command(about = "StoryWeave realtime collaboration session", long_about = None)]
struct Args {
    /// Config file (TOML, YAML or JSON)
    #[arg(long, env = "STORYWEAVE_CONFIG")]
    config: Option<String>,

    /// Story to collaborate on
    #[arg(long, default_value = "demo-story")]
    story: String,

    /// Chapter the local participant is writing in
    #[arg(long, default_value = "chapter-1")]
    chapter: String,

    /// Local participant ID
    #[arg(long, default_value = "alice")]
    local: String,

    /// Simulated peer participant ID
    #[arg(long, default_value = "bob")]
    peer: String,

    /// Drop the story's channel once to exercise reconnection
    #[arg(long)]
    simulate_fault: bool,

    /// Keep the session open until Ctrl+C
    #[arg(long)]
    follow: bool,

    /// Seconds to wait for a channel to become connected
    #[arg(long, default_value = "90")]
    connect_timeout_secs: u64,
}

/// Poll until the session reports connected or the timeout expires
async fn wait_connected(session: &ChannelSession, timeout: Duration) -> Result<()> {
    tokio::time::timeout(timeout, async {
        while !session.is_connected() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .with_context(|| {
        format!(
            "Channel for story {} not connected (state: {})",
            session.story_id(),
            session.state()
        )
    })
}

fn peer_callbacks(name: &str) -> SessionCallbacks {
    let on_presence = name.to_string();
    let on_message = name.to_string();
    let on_error = name.to_string();

    SessionCallbacks::new()
        .on_presence_change(move |story_id, records| {
            let present: Vec<&str> = records.iter().map(|r| r.user_id.as_str()).collect();
            info!(
                viewer = %on_presence,
                story_id = %story_id,
                present = ?present,
                "Presence changed"
            );
        })
        .on_message(move |message| {
            info!(
                viewer = %on_message,
                kind = %message.kind,
                sender = %message.sender,
                payload = %message.payload,
                "Message received"
            );
        })
        .on_error(move |e| {
            warn!(viewer = %on_error, error = %e, "Realtime error");
        })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration
    let config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;

    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("StoryWeave realtime session starting...");

    // 3. In-process hub shared by both participants
    let hub = LocalHub::new();
    let story = StoryId::from(args.story.as_str());
    let topic = config.realtime.topic_for(story.as_str());
    let timeout = Duration::from_secs(args.connect_timeout_secs);

    let local = ChannelRegistry::new(
        Arc::new(hub.clone()),
        ParticipantId::from(args.local.as_str()),
        config.realtime.clone(),
    );
    let peer = ChannelRegistry::new(
        Arc::new(hub.clone()),
        ParticipantId::from(args.peer.as_str()),
        config.realtime.clone(),
    );

    // 4. Join the story
    let local_session = local.connect_to_story(story.clone(), peer_callbacks(&args.local));
    let peer_session = peer.connect_to_story(story.clone(), peer_callbacks(&args.peer));
    wait_connected(&local_session, timeout).await?;
    wait_connected(&peer_session, timeout).await?;
    info!(
        topic = %topic,
        local = %local.participant_id(),
        subscribers = hub.subscriber_count(&topic),
        "Both participants connected"
    );

    // 5. Collaborate
    local
        .send_typing(&story, true, Some(args.chapter.as_str()), None)
        .await;
    local
        .send_message(
            &story,
            serde_json::json!({ "text": format!("Drafting {}", args.chapter) }),
        )
        .await;
    peer.send_cursor(&story, serde_json::json!({ "chapter_id": &args.chapter, "offset": 0 }))
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let typing = peer.get_typing_users(&story, Some(args.chapter.as_str()));
    info!(chapter = %args.chapter, typing = ?typing, "Typing participants");

    local
        .send_typing(&story, false, Some(args.chapter.as_str()), None)
        .await;

    // 6. Optional fault injection
    if args.simulate_fault {
        let hit = hub.fail_topic(&topic, "simulated transport fault");
        warn!(topic = %topic, subscribers = hit, "Injected transport fault");
        tokio::time::sleep(Duration::from_millis(100)).await;

        if let Err(e) = wait_connected(&local_session, timeout).await {
            error!("{e:#}");
        }
        if let Err(e) = wait_connected(&peer_session, timeout).await {
            error!("{e:#}");
        }
    }

    // 7. Report presence as seen by the local participant
    let records = local.get_story_presences(&story);
    println!("{}", serde_json::to_string_pretty(&records)?);

    if args.follow {
        info!("Session open, press Ctrl+C to leave");
        tokio::signal::ctrl_c().await?;
        info!("Received shutdown signal");
    }

    // 8. Leave
    local.disconnect_all().await;
    peer.disconnect_all().await;
    info!("StoryWeave realtime session finished");

    Ok(())
}
