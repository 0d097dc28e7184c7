use {
    clap::Parser,
    std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    warp9::{
        srv,
        wkit::{Digest32, DigestItem, DirItem, Directory, EventItem, Item, ObjectTree, PlainItem},
    },
};

/// Serves a small, fixed object tree over Warp9: a greeting file, a
/// running checksum, and a broadcast event queue.
#[derive(Debug, Parser)]
struct Cli {
    /// proto!address!port, where proto = tcp | unix
    #[arg(long, default_value = "tcp!0.0.0.0!9090")]
    addr: String,

    /// Enable debug-level logging
    #[arg(short, long)]
    debug: bool,
}

/// A running, order-dependent checksum exposed through `DigestItem`. Not
/// cryptographic — just enough to show a read-only aggregate whose value
/// changes as clients write to it.
struct RunningChecksum(AtomicU32);

impl RunningChecksum {
    fn new() -> Self {
        RunningChecksum(AtomicU32::new(0))
    }
}

impl Digest32 for RunningChecksum {
    fn sum32(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }
    fn write(&self, data: &[u8]) {
        let mut acc = self.0.load(Ordering::Relaxed);
        for &b in data {
            acc = acc.wrapping_mul(31).wrapping_add(b as u32);
        }
        self.0.store(acc, Ordering::Relaxed);
    }
}

async fn build_tree() -> Arc<DirItem> {
    let root = DirItem::new_root("/");

    let motd = PlainItem::new("motd");
    let _ = motd.write(0, b"welcome to warp9\n").await;
    root.insert(motd).await;

    root.insert(DigestItem::new("sum", Arc::new(RunningChecksum::new()))).await;
    root.insert(EventItem::new("events")).await;

    root
}

async fn demo_main(cli: Cli) -> warp9::Result<()> {
    log::info!("warp9-demo serving {}", cli.addr);
    let tree = ObjectTree::new(build_tree().await);
    srv::serve(tree, &cli.addr).await
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let level = if cli.debug { log::LevelFilter::Debug } else { log::LevelFilter::Info };
    env_logger::Builder::new().filter_level(level).init();

    if let Err(e) = demo_main(cli).await {
        eprintln!("Error: {:?}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tree_has_motd_sum_and_events() {
        let root = build_tree().await;
        let names: Vec<String> = root.children().await.iter().map(|i| i.name()).collect();
        assert!(names.contains(&"motd".to_string()));
        assert!(names.contains(&"sum".to_string()));
        assert!(names.contains(&"events".to_string()));
    }

    #[test]
    fn checksum_changes_with_input() {
        let sum = RunningChecksum::new();
        let before = sum.sum32();
        sum.write(b"hello");
        assert_ne!(sum.sum32(), before);
    }
}
