pub mod http;
pub mod sandbox;
pub mod traits;

pub use http::PlatformApiClient;
pub use sandbox::{PayoutOutcome, SandboxLedger, SandboxPayoutGateway, SandboxProfiles};
pub use traits::{LedgerClient, PayoutGateway, PayoutReceipt, PayoutRequest, ProfileClient};

use std::sync::Arc;

use crate::settlement::events::EventPublisher;

/// External systems the engine talks to
#[derive(Clone)]
pub struct Collaborators {
    pub ledger: Arc<dyn LedgerClient>,
    pub profiles: Arc<dyn ProfileClient>,
    pub gateway: Arc<dyn PayoutGateway>,
    pub events: Arc<dyn EventPublisher>,
}
