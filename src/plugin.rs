// =============================================================================
// Decision plugin seam (greenlight mode)
// =============================================================================
//
// Greenlight users delegate the whole decision to a plugin: the engine
// hands over the tick's snapshot, the portfolio, and the latest feedback
// string, and executes whatever comes back through the normal order path.
// The LLM-driven implementation lives outside this crate; invocation is
// gated to paper accounts.
// =============================================================================

use async_trait::async_trait;

use crate::error::EngineResult;
use crate::snapshot::Snapshot;
use crate::types::HoldingInfo;

/// The portfolio view a plugin decides over.
#[derive(Debug, Clone, Default)]
pub struct PortfolioView {
    pub holdings: Vec<HoldingInfo>,
    pub cash: i64,
    pub total_assets: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PluginAction {
    Buy { ticker: String, quantity: i64 },
    Sell { ticker: String, quantity: i64 },
}

#[derive(Debug, Clone)]
pub struct PluginDecision {
    pub action: PluginAction,
    pub reason: String,
}

#[async_trait]
pub trait DecisionPlugin: Send + Sync {
    fn name(&self) -> &str;

    /// Produce the tick's decisions. An empty vector means hold everything.
    async fn decide(
        &self,
        snapshot: &Snapshot,
        portfolio: &PortfolioView,
        feedback: &str,
    ) -> EngineResult<Vec<PluginDecision>>;
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// Replays a fixed decision list; used by controller tests.
    pub struct FixedPlugin(pub Vec<PluginDecision>);

    #[async_trait]
    impl DecisionPlugin for FixedPlugin {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn decide(
            &self,
            _snapshot: &Snapshot,
            _portfolio: &PortfolioView,
            _feedback: &str,
        ) -> EngineResult<Vec<PluginDecision>> {
            Ok(self.0.clone())
        }
    }
}
