use std::collections::VecDeque;
use std::io::{self, IsTerminal, Read};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde_json::json;

use trellis_dispatch::{DispatchError, WorkerCall, WorkerDispatcher};
use trellis_engine::{ChannelNotifier, Engine, ExecutionEvent};
use trellis_graph::{GraphDef, compile};
use trellis_store::{MemoryStore, NodeStatus, SqliteStore, Store, TriggerMeta};

/// Trellis - a workflow automation engine driven by worker callbacks
#[derive(Parser)]
#[command(name = "trellis")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the data directory (default: ~/.trellis)
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Compile a graph file and report what the executor would see
  Validate {
    /// Path to the graph file (JSON)
    graph_file: PathBuf,
  },

  /// Run a graph end-to-end with a local echo worker
  Run {
    /// Path to the graph file (JSON)
    graph_file: PathBuf,

    /// Entity reference to track through the run
    #[arg(long)]
    entity: Option<String>,

    /// Persist run state to SQLite under the data directory
    #[arg(long)]
    persist: bool,
  },
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  let data_dir = cli.data_dir.unwrap_or_else(|| {
    dirs::home_dir()
      .expect("could not determine home directory")
      .join(".trellis")
  });

  match cli.command {
    Some(Commands::Validate { graph_file }) => validate(graph_file),
    Some(Commands::Run {
      graph_file,
      entity,
      persist,
    }) => {
      let rt = tokio::runtime::Runtime::new()?;
      rt.block_on(async { run(graph_file, entity, persist, data_dir).await })
    }
    None => {
      println!("trellis - use --help to see available commands");
      Ok(())
    }
  }
}

fn load_graph(graph_file: &PathBuf) -> Result<GraphDef> {
  let content = std::fs::read_to_string(graph_file)
    .with_context(|| format!("failed to read graph file: {}", graph_file.display()))?;
  serde_json::from_str(&content)
    .with_context(|| format!("failed to parse graph file: {}", graph_file.display()))
}

fn validate(graph_file: PathBuf) -> Result<()> {
  let def = load_graph(&graph_file)?;
  let graph =
    compile(&def).with_context(|| format!("graph '{}' failed to compile", def.graph_id))?;

  println!("{} ({})", graph.version_ref(), def.name);
  println!("  nodes: {}", graph.node_count());
  println!("  entry: {}", graph.entry_nodes().join(", "));
  println!("  terminal: {}", graph.terminal_nodes().join(", "));
  Ok(())
}

async fn run(
  graph_file: PathBuf,
  entity: Option<String>,
  persist: bool,
  data_dir: PathBuf,
) -> Result<()> {
  let def = load_graph(&graph_file)?;
  let graph =
    compile(&def).with_context(|| format!("graph '{}' failed to compile", def.graph_id))?;
  eprintln!("Compiled graph: {}", graph.version_ref());

  let payload = read_payload_from_stdin()?;
  eprintln!("Payload: {payload}");

  let store: Arc<dyn Store> = if persist {
    std::fs::create_dir_all(&data_dir)
      .with_context(|| format!("failed to create data dir: {}", data_dir.display()))?;
    let url = format!("sqlite://{}", data_dir.join("runs.db").display());
    Arc::new(
      SqliteStore::connect(&url)
        .await
        .with_context(|| format!("failed to open run database at {url}"))?,
    )
  } else {
    Arc::new(MemoryStore::new())
  };

  let dispatcher = Arc::new(LoopbackDispatcher::default());
  let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel();
  let engine = Engine::with_notifier(store, dispatcher.clone(), ChannelNotifier::new(event_tx));

  let graph_ref = engine.register_graph(graph);
  let run_id = engine
    .start_run(&graph_ref, payload, entity, TriggerMeta::Manual { actor: None })
    .await
    .context("failed to start run")?;
  eprintln!("Run started: {run_id}");

  // Drive the run: echo every dispatched worker call straight back as a
  // completion, and wave through any gate that suspends.
  let mut rounds = 0;
  loop {
    while let Ok(event) = event_rx.try_recv() {
      print_event(&event);
    }

    if let Some(call) = dispatcher.pop() {
      let output = echo_output(&call);
      engine
        .worker_callback(
          &run_id,
          &call.node_id,
          json!({"status": "completed", "output": output}),
        )
        .await
        .context("echo callback failed")?;
      continue;
    }

    let run = engine.get_run(&run_id).await.context("failed to load run")?;
    let waiting: Vec<String> = run
      .node_states
      .iter()
      .filter(|(_, state)| state.status == NodeStatus::WaitingForInput)
      .map(|(id, _)| id.clone())
      .collect();
    if !waiting.is_empty() {
      for node_id in waiting {
        eprintln!("Gate '{node_id}' waiting - completing with empty input");
        engine
          .complete_gate(&run_id, &node_id, json!({}))
          .await
          .context("gate completion failed")?;
      }
      continue;
    }

    if run.status.is_terminal() {
      while let Ok(event) = event_rx.try_recv() {
        print_event(&event);
      }
      eprintln!("Run finished: {}", run.status.as_str());
      println!("{}", serde_json::to_string_pretty(&run.node_states)?);
      return Ok(());
    }

    rounds += 1;
    if rounds > 10_000 {
      bail!("run {run_id} made no progress; aborting the drive loop");
    }
  }
}

fn echo_output(call: &WorkerCall) -> serde_json::Value {
  match &call.input {
    serde_json::Value::Object(_) => json!({"echoed": true}),
    other => json!({"echoed": true, "value": other}),
  }
}

fn print_event(event: &ExecutionEvent) {
  match event {
    ExecutionEvent::RunStarted { graph_ref, .. } => eprintln!("  started against {graph_ref}"),
    ExecutionEvent::NodeFired { node_id, .. } => eprintln!("  fired {node_id}"),
    ExecutionEvent::NodeCompleted { node_id, .. } => eprintln!("  completed {node_id}"),
    ExecutionEvent::NodeFailed { node_id, error, .. } => {
      eprintln!("  failed {node_id}: {error}")
    }
    ExecutionEvent::GateWaiting { node_id, .. } => eprintln!("  gate {node_id} waiting"),
    ExecutionEvent::NodeRetried { node_id, .. } => eprintln!("  retried {node_id}"),
    ExecutionEvent::RunFinished { status, .. } => eprintln!("  run {}", status.as_str()),
  }
}

fn read_payload_from_stdin() -> Result<serde_json::Value> {
  if io::stdin().is_terminal() {
    // No piped payload: run with an empty object.
    return Ok(json!({}));
  }
  let mut buffer = String::new();
  io::stdin()
    .read_to_string(&mut buffer)
    .context("failed to read payload from stdin")?;
  if buffer.trim().is_empty() {
    return Ok(json!({}));
  }
  serde_json::from_str(buffer.trim()).context("payload is not valid JSON")
}

/// Queues worker calls in-process so the drive loop can echo them back as
/// completions.
#[derive(Default)]
struct LoopbackDispatcher {
  queue: Mutex<VecDeque<WorkerCall>>,
}

impl LoopbackDispatcher {
  fn pop(&self) -> Option<WorkerCall> {
    self
      .queue
      .lock()
      .expect("loopback queue lock poisoned")
      .pop_front()
  }
}

#[async_trait]
impl WorkerDispatcher for LoopbackDispatcher {
  fn callback_url(&self, run_id: &str, node_id: &str) -> String {
    format!("loopback://runs/{run_id}/nodes/{node_id}/callback")
  }

  async fn dispatch(&self, _endpoint: &str, call: WorkerCall) -> Result<(), DispatchError> {
    self
      .queue
      .lock()
      .expect("loopback queue lock poisoned")
      .push_back(call);
    Ok(())
  }
}
