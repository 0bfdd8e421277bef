//! forgebot service entry point.

use anyhow::Context as _;
use clap::Parser;

use forgebot::channels::ChannelAdapter as _;
use forgebot::channels::github::GitHubChannel;
use forgebot::channels::matrix::Bot;
use forgebot::config::Settings;
use forgebot::decider::Decider;
use forgebot::llm::OpenAiClient;
use forgebot::runner::TaskRunner;
use forgebot::sandbox::SandboxManager;

use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "forgebot", version)]
#[command(about = "Multi-channel autonomous coding-agent dispatcher")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn init_tracing(debug: bool) {
    let default = if debug { "forgebot=debug" } else { "forgebot=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let settings = Settings::from_env().context("failed to load settings")?;

    // Construct the component stack.
    let sandbox = Arc::new(SandboxManager::new(settings.clone()));
    let backend = Arc::new(OpenAiClient::new(&settings));
    let decider = Decider::new(&settings, backend, Arc::clone(&sandbox));
    let runner = TaskRunner::new(Arc::clone(&decider), Arc::clone(&sandbox));

    // Restore persisted state. Containers the runtime no longer reports as
    // running are dropped here, along with their histories.
    let histories = sandbox.load_state().await?;
    decider.load_histories(histories);

    // Forge channel first: scan for still-open tasks, start the webhook
    // listener, then replay each recovered task as a real message.
    let forge = if settings.forge_enabled() {
        let channel = GitHubChannel::new(Arc::clone(&runner), &settings);
        let recovered = channel.recover_tasks().await;
        channel.start().await?;
        for (task_id, message) in recovered {
            runner.enqueue(&task_id, &message, Arc::clone(&channel) as _);
        }
        Some(channel)
    } else {
        info!("GITHUB_TOKEN not set, forge channel disabled");
        None
    };

    // Chat channel: sync, join stale invites, then shield every room whose
    // container survived from the orphan sweep below. pre_register, not
    // enqueue: recovery must not fabricate a message.
    let bot = Bot::login(&settings, Arc::clone(&runner)).await?;
    let rooms = bot.initial_sync().await?;
    let live: HashSet<String> = sandbox.task_ids().into_iter().collect();
    for room_id in &rooms {
        if live.contains(room_id) {
            info!(room_id, "pre-registering recovered chat task");
            runner.pre_register(room_id, bot.channel(room_id) as _);
        }
    }

    // Only now is it safe to sweep: anything still unregistered is truly
    // abandoned.
    runner.destroy_orphans().await;

    let reconcile = tokio::spawn(Arc::clone(&runner).reconcile_loop());
    tokio::select! {
        _ = bot.sync_forever() => {}
        _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
    }

    reconcile.abort();
    bot.shutdown();
    if let Some(forge) = forge {
        forge.stop().await;
    }
    info!("shutting down; containers survive for the next run");
    Ok(())
}
