pub mod backend;
pub mod credentials;
pub mod dispatcher;
pub mod error;
pub mod local;
pub mod state;
pub mod store;
pub mod tmux;
pub mod types;
pub mod webhook;
pub mod worktree;

pub use backend::{ExecutionBackend, ExecutionStatus};
pub use credentials::{CredentialRefresher, HttpTokenIssuer, TokenIssuer, UnconfiguredIssuer};
pub use dispatcher::{DispatcherConfig, PollReport, TaskDispatcher};
pub use error::{CredentialError, DispatchError, StoreError};
pub use local::LocalBackend;
pub use state::SharedState;
pub use store::StateStore;
pub use tmux::TmuxBackend;
pub use types::*;
pub use webhook::{
    DeliveryOutcome, ReqwestWebhookClient, RetrySummary, WebhookDelivery, WebhookHttpClient,
};
