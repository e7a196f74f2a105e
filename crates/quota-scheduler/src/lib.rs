pub mod admission;
pub mod cluster_view;
pub mod config;
pub mod cycle_state;
pub mod error;
pub mod events;
pub mod migrator;
pub mod plugin;
pub mod recovery;

pub use admission::Verdict;
pub use cluster_view::ClusterView;
pub use config::PluginConfig;
pub use cycle_state::CycleState;
pub use error::PluginError;
pub use plugin::QuotaPlugin;
