use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{info, warn};

use netmind_chat::{
    AutoWatchIntegrator, ChatOrchestrator, Dispatcher, OrchestratorDeps, PlainTextAdapter,
    QuickActionKind,
};
use netmind_core::config::NetmindConfig;
use netmind_core::events::EventLog;
use netmind_core::settings::ConfigStore;
use netmind_core::types::{ConversationId, RuleId, Scope, Utterance};
use netmind_intent::{Classifier, IntentRouter};
use netmind_plugin::{HttpLlmClient, LlmClient, PluginContext, PluginRegistry, PluginServices};
use netmind_store::{db, ConversationStore, DeviceCatalog};
use netmind_watch::{PluginProbe, WatchDeps, WatchManager};

mod fallback;

/// Conversational network-operations assistant (programmatic core).
#[derive(Parser, Debug)]
#[command(name = "netmind", version)]
struct Args {
    /// Path to netmind.toml (default: ~/.netmind/netmind.toml).
    #[arg(long)]
    config: Option<String>,

    /// Override the database path.
    #[arg(long)]
    db: Option<String>,

    /// Initial scope (local|network|internet|vpn|tor|remote).
    #[arg(long)]
    scope: Option<Scope>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = NetmindConfig::load(args.config.as_deref()).unwrap_or_else(|e| {
        eprintln!("config load failed ({e}), using defaults");
        NetmindConfig::default()
    });

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("netmind={}", config.log.level).into()),
        )
        .init();

    let events = Arc::new(EventLog::new());
    let settings = Arc::new(ConfigStore::open(
        &config.database.settings_path,
        Some(Arc::clone(&events)),
    ));
    config.seed_settings(&settings);

    let db_path = args.db.clone().unwrap_or_else(|| config.database.path.clone());
    let catalog = Arc::new(DeviceCatalog::new(db::open(&db_path)?));
    let store = Arc::new(ConversationStore::spawn(
        db::open_existing(&db_path)?,
        db::open_existing(&db_path)?,
    ));
    info!(path = %db_path, "database ready");

    let llm: Option<Arc<dyn LlmClient>> = config.llm.as_ref().map(|cfg| {
        Arc::new(HttpLlmClient::new(
            cfg.base_url.clone(),
            cfg.api_key.clone(),
            cfg.model.clone(),
        )) as Arc<dyn LlmClient>
    });

    let services = Arc::new(PluginServices {
        config: Arc::clone(&settings),
        events: Arc::clone(&events),
        catalog: Arc::clone(&catalog),
        conversations: Arc::clone(&store),
        llm: llm.clone(),
    });
    let base_ctx = PluginContext::new(true, services);

    let registry = Arc::new(PluginRegistry::new());
    registry
        .register(Arc::new(fallback::ChatPlugin), &base_ctx)
        .await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let probe = Arc::new(PluginProbe::new(Arc::clone(&registry), base_ctx.clone()));
    let (watch_handle, change_rx) = WatchManager::start(
        WatchDeps {
            config: Arc::clone(&settings),
            events: Arc::clone(&events),
            catalog: Arc::clone(&catalog),
            store: Arc::clone(&store),
            probe,
        },
        shutdown_rx,
    );

    let autowatch = Arc::new(AutoWatchIntegrator::new(
        Arc::clone(&settings),
        Arc::clone(&events),
        Arc::clone(&catalog),
        Arc::clone(&store),
        watch_handle.clone(),
    ));
    Arc::clone(&autowatch).spawn_change_listener(change_rx);

    let classifier = llm.map(Classifier::new);
    let router = IntentRouter::new(Arc::clone(&settings), Arc::clone(&registry), classifier);
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&registry),
        Arc::clone(&events),
        Arc::clone(&settings),
    ));

    let initial_scope = args.scope.unwrap_or(config.scope.active);
    let orchestrator = Arc::new(ChatOrchestrator::new(OrchestratorDeps {
        router,
        dispatcher,
        store: Arc::clone(&store),
        events: Arc::clone(&events),
        autowatch,
        watch: watch_handle,
        adapter: Arc::new(PlainTextAdapter),
        base_ctx,
        initial_scope,
    }));

    println!("netmind gotowy; zakres: {initial_scope}. /help pokaże polecenia.");
    repl(orchestrator).await;

    let _ = shutdown_tx.send(true);
    registry.dispose_all().await;
    Ok(())
}

async fn repl(orchestrator: Arc<ChatOrchestrator>) {
    let conversation = ConversationId::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line.split_once(' ').map_or((line, ""), |(a, b)| (a, b)) {
            ("/quit", _) | ("/exit", _) => break,
            ("/help", _) => {
                println!(
                    "/scope <s>   zmień zakres\n/watches     aktywne monitory\n\
                     /stop <id>   zatrzymaj monitor\n/logs <id>   historia zmian\n\
                     /quit        zakończ"
                );
            }
            ("/scope", rest) => match rest.trim().parse::<Scope>() {
                Ok(scope) => {
                    orchestrator.set_scope(scope);
                    println!("zakres: {scope}");
                }
                Err(e) => println!("{e}"),
            },
            ("/watches", _) => match orchestrator.watch_list().await {
                Ok(rules) if rules.is_empty() => println!("brak aktywnych monitorów"),
                Ok(rules) => {
                    for rule in rules {
                        println!(
                            "{}  {}  co {}ms  do {}",
                            rule.id, rule.target, rule.poll_interval_ms, rule.expires_at
                        );
                    }
                }
                Err(e) => println!("błąd: {e}"),
            },
            ("/stop", rest) => {
                match orchestrator.watch_stop(&RuleId::from(rest.trim())).await {
                    Ok(()) => println!("zatrzymano"),
                    Err(e) => println!("błąd: {e}"),
                }
            }
            ("/logs", rest) => match orchestrator.watch_logs(&RuleId::from(rest.trim())) {
                Ok(logs) if logs.is_empty() => println!("brak zmian"),
                Ok(logs) => {
                    for record in logs {
                        println!(
                            "{}  {}  {:.0}%  {}",
                            record.detected_at,
                            record.change_type,
                            record.change_score * 100.0,
                            record.summary
                        );
                    }
                }
                Err(e) => println!("błąd: {e}"),
            },
            _ => {
                let utterance = Utterance::text_input(conversation.clone(), line);
                match orchestrator.turn(utterance).await {
                    Ok(outcome) => {
                        println!("{}", outcome.assistant_message.text);
                        for action in &outcome.quick_actions {
                            let hint = match &action.kind {
                                QuickActionKind::Execute { query } => query.clone(),
                                QuickActionKind::Prefill { text } => format!("{text}…"),
                                QuickActionKind::Link { url } => url.clone(),
                            };
                            println!("  [{}] {}", action.label, hint);
                        }
                    }
                    Err(e) => {
                        warn!("turn failed: {e}");
                        println!("błąd: {e}");
                    }
                }
            }
        }
    }
}
