use clap::Parser;

/// Watches Docker containers and keeps Nginx Proxy Manager, Pi-hole and
/// AdGuard Home in step with their `plugNPiN.*` labels.
#[derive(Debug, Parser)]
#[command(name = "plugNPiN", version)]
pub struct Flags {
    /// Log what would be done without contacting any backend
    #[arg(short, long)]
    pub dry_run: bool,
}
