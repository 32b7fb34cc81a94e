use anyhow::Result;
use async_trait::async_trait;
use flywheel_types::EngineError;
use flywheel_util::Id;

/// Checked once per trigger before any state is created. Billing systems
/// plug in here; the failure is surfaced to the caller and no run exists.
#[async_trait]
pub trait EntitlementChecker: Send + Sync {
	async fn check(&self, organization_id: Id) -> Result<()>;
}

pub struct AllowAll;

#[async_trait]
impl EntitlementChecker for AllowAll {
	async fn check(&self, _organization_id: Id) -> Result<()> {
		Ok(())
	}
}

/// Denies every organization in the given list. Mostly useful in tests.
pub struct DenyList {
	pub organizations: Vec<Id>,
}

#[async_trait]
impl EntitlementChecker for DenyList {
	async fn check(&self, organization_id: Id) -> Result<()> {
		if self.organizations.contains(&organization_id) {
			return Err(EngineError::OutOfEntitlement.into());
		}
		Ok(())
	}
}
