use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

use listsync::config::Config;
use listsync::connectivity::ConnectivityMonitor;
use listsync::logging;
use listsync::mutation::Mutation;
use listsync::notify::{ChannelNotifier, MutationFailure};
use listsync::queue::{FlushReport, MutationQueue};
use listsync::remote::HttpBackend;
use listsync::snapshot::SnapshotCache;
use listsync::store;
use listsync::view::ListView;

#[derive(Parser, Debug)]
#[command(name = "listsync")]
#[command(about = "Offline-first client for shared to-do lists")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/listsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Mirror logs to stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Add an item to a list
  Add { list: String, name: String },
  /// Mark an item as done
  Check { list: String, item: String },
  /// Mark an item as not done
  Uncheck { list: String, item: String },
  /// Set the manual order of items
  Reorder {
    list: String,
    #[arg(required = true, num_args = 1..)]
    items: Vec<String>,
  },
  /// Show a list with pending changes applied
  Show { list: String },
  /// Show all lists
  Lists,
  /// Show mutations waiting to be sent
  Pending,
  /// Send pending mutations once
  Flush,
  /// Keep syncing in the foreground until interrupted
  Sync {
    /// Also poll and print this list whenever it changes
    #[arg(short, long)]
    list: Option<String>,
  },
}

struct Context {
  config: Config,
  backend: Arc<HttpBackend>,
  queue: Arc<MutationQueue>,
  snapshots: SnapshotCache,
  failures: mpsc::UnboundedReceiver<MutationFailure>,
}

impl Context {
  fn build(config: Config) -> Result<Self> {
    let store = store::open(&config.storage);
    let backend = Arc::new(HttpBackend::new(&config)?);
    let (notifier, failures) = ChannelNotifier::new();

    let queue = MutationQueue::new(
      store.clone(),
      backend.clone(),
      Arc::new(notifier),
      Arc::new(ConnectivityMonitor::default()),
      config.backend.actor.clone(),
    )
    .with_policy(config.sync.retry_policy());

    Ok(Self {
      snapshots: SnapshotCache::new(store, backend.clone()),
      config,
      backend,
      queue: Arc::new(queue),
      failures,
    })
  }

  fn view(&self, list_id: &str) -> ListView {
    ListView::new(list_id, self.queue.clone(), self.snapshots.clone())
  }

  /// Submit, then try to send right away.
  async fn submit(&mut self, mutation: Mutation) -> Result<()> {
    let description = mutation.describe();
    let id = self
      .queue
      .submit(mutation)
      .map_err(|e| eyre!("Failed to queue mutation: {}", e))?;
    println!("Queued #{}: {}", id, description);

    let report = self.queue.flush().await;
    print_report(&report);
    self.drain_failures();
    Ok(())
  }

  fn drain_failures(&mut self) {
    while let Ok(failure) = self.failures.try_recv() {
      eprintln!("{}", failure);
    }
  }
}

fn print_report(report: &FlushReport) {
  if report.dispatched == 0 {
    return;
  }
  let mut line = format!("Sent {}, failed {}", report.confirmed, report.failed);
  if report.halted {
    line.push_str(", remaining changes stay queued");
  }
  println!("{}", line);
}

fn print_view(view: &ListView) {
  if view.is_using_cache() {
    println!("(offline: showing cached data)");
  }
  for row in view.items() {
    let mark = if row.item.checked { "x" } else { " " };
    let pending = if row.is_optimistic { "*" } else { " " };
    println!("{}[{}] {}  ({})", pending, mark, row.item.name, row.item.id);
  }
}

async fn run_sync(ctx: Context, list: Option<String>) -> Result<()> {
  let Context {
    config,
    backend,
    queue,
    snapshots,
    mut failures,
  } = ctx;

  let monitor = queue.monitor().clone();
  tokio::spawn(monitor.run_probe(backend, config.sync.probe_interval()));
  tokio::spawn(queue.clone().run(config.sync.flush_interval()));
  tokio::spawn(async move {
    while let Some(failure) = failures.recv().await {
      eprintln!("{}", failure);
    }
  });

  if let Some(list_id) = list {
    let view = Arc::new(ListView::new(list_id, queue.clone(), snapshots));
    let mut rows = view.subscribe();
    tokio::spawn(view.clone().run(config.sync.poll_interval()));
    tokio::spawn(async move {
      while rows.changed().await.is_ok() {
        rows.borrow_and_update();
        print_view(&view);
        println!();
      }
    });
  }

  info!("sync running");
  tokio::signal::ctrl_c()
    .await
    .map_err(|e| eyre!("Failed to listen for interrupt: {}", e))?;
  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = logging::init(args.verbose)?;

  let config = Config::load(args.config.as_deref())?;
  let mut ctx = Context::build(config)?;

  match args.command {
    Command::Add { list, name } => ctx.submit(Mutation::add_item(list, name)).await?,
    Command::Check { list, item } => ctx.submit(Mutation::check_item(list, item)).await?,
    Command::Uncheck { list, item } => ctx.submit(Mutation::uncheck_item(list, item)).await?,
    Command::Reorder { list, items } => ctx.submit(Mutation::reorder_items(list, items)).await?,
    Command::Show { list } => {
      let view = ctx.view(&list);
      view.refresh().await?;
      print_view(&view);
    }
    Command::Lists => {
      let result = ctx.snapshots.fetch_lists().await?;
      if result.is_offline() {
        println!("(offline: showing cached data)");
      }
      for list in result.data {
        println!("{}  {}", list.id, list.name);
      }
    }
    Command::Pending => {
      let pending = ctx
        .queue
        .pending()
        .map_err(|e| eyre!("Failed to read queue: {}", e))?;
      if pending.is_empty() {
        println!("Nothing pending");
      }
      for record in pending {
        println!(
          "#{}  {}  {}  (attempts: {})",
          record.id,
          record.enqueued_at.format("%Y-%m-%d %H:%M:%S"),
          record.mutation.describe(),
          record.retry_count
        );
      }
    }
    Command::Flush => {
      let report = ctx.queue.flush().await;
      if report.dispatched == 0 {
        println!("Nothing pending");
      }
      print_report(&report);
      ctx.drain_failures();
    }
    Command::Sync { list } => run_sync(ctx, list).await?,
  }

  Ok(())
}
