//! Resolves source/destination account ids and regions into a `RunContext`.
//!
//! Region defaults are resolved where the providers are constructed (a
//! provider is always bound to a region); this stage fills in the account
//! ids and records which source mode downstream stages must branch on.

use amiferry_common::{AmiError, CloudProvider, Result, RunContext, SourceSpec};
use tracing::instrument;

#[instrument(skip_all)]
pub async fn resolve(
    source: &dyn CloudProvider,
    destination: &dyn CloudProvider,
    spec: &SourceSpec,
) -> Result<RunContext> {
    let destination_account = destination.account_id().await?;

    let source_account = match spec {
        SourceSpec::Profile(_) => source.account_id().await?,
        SourceSpec::SharedAccount(account) => {
            if account.is_empty() || !account.chars().all(|c| c.is_ascii_digit()) {
                return Err(AmiError::Configuration(format!(
                    "source account id must be numeric, got {account:?}"
                )));
            }
            account.clone()
        }
    };

    Ok(RunContext {
        source_account,
        destination_account,
        source_region: source.region().to_string(),
        destination_region: destination.region().to_string(),
        shared_source: spec.is_shared(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockCloud;

    fn provider(region: &str, account: &str) -> MockCloud {
        let mut cloud = MockCloud::new();
        cloud.expect_region().return_const(region.to_string());
        let account = account.to_string();
        cloud
            .expect_account_id()
            .returning(move || Ok(account.clone()));
        cloud
    }

    #[tokio::test]
    async fn profile_mode_looks_up_both_accounts() {
        let source = provider("eu-west-1", "111111111111");
        let destination = provider("eu-central-1", "222222222222");

        let ctx = resolve(
            &source,
            &destination,
            &SourceSpec::Profile("src".to_string()),
        )
        .await
        .unwrap();
        assert_eq!(ctx.source_account, "111111111111");
        assert_eq!(ctx.destination_account, "222222222222");
        assert_eq!(ctx.source_region, "eu-west-1");
        assert_eq!(ctx.destination_region, "eu-central-1");
        assert!(!ctx.shared_source);
    }

    #[tokio::test]
    async fn shared_mode_skips_source_identity_lookup() {
        let mut source = MockCloud::new();
        source.expect_region().return_const("us-east-1".to_string());
        source.expect_account_id().never();
        let destination = provider("us-west-2", "222222222222");

        let ctx = resolve(
            &source,
            &destination,
            &SourceSpec::SharedAccount("333333333333".to_string()),
        )
        .await
        .unwrap();
        assert_eq!(ctx.source_account, "333333333333");
        assert!(ctx.shared_source);
    }

    #[tokio::test]
    async fn shared_mode_rejects_non_numeric_account() {
        let mut source = MockCloud::new();
        source.expect_region().return_const("us-east-1".to_string());
        let destination = provider("us-west-2", "222222222222");

        let err = resolve(
            &source,
            &destination,
            &SourceSpec::SharedAccount("prod-profile".to_string()),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AmiError::Configuration(_)));
    }

    #[tokio::test]
    async fn identity_lookup_failure_is_fatal() {
        let mut destination = MockCloud::new();
        destination
            .expect_region()
            .return_const("us-west-2".to_string());
        destination
            .expect_account_id()
            .returning(|| Err(AmiError::Authorization("GetCallerIdentity failed".into())));
        let source = provider("eu-west-1", "111111111111");

        let err = resolve(
            &source,
            &destination,
            &SourceSpec::Profile("src".to_string()),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AmiError::Authorization(_)));
    }
}
