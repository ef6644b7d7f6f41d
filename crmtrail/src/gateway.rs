//! Backend gateway
//!
//! Every backend operation goes through [`BackendGateway`], which tries the
//! connection candidates in order until one succeeds. A run that exhausts
//! every candidate fails with [`CrmTrailError::Unavailable`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use crmtrail_core::error::{CrmTrailError, Result};
use crmtrail_core::query::QueryExpression;
use crmtrail_core::record::BackendRecord;
use log::{debug, warn};

use crate::connection::ConnectionCandidate;

/// Session-level access to the CRM backend for one candidate
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Run a query and return every matching record
    async fn retrieve_multiple(
        &self,
        candidate: &ConnectionCandidate,
        query: &QueryExpression,
    ) -> Result<Vec<BackendRecord>>;

    /// Return the total record count of each named entity
    async fn retrieve_total_record_count(
        &self,
        candidate: &ConnectionCandidate,
        entity_names: &[String],
    ) -> Result<HashMap<String, u64>>;
}

/// Operation sent through the gateway
#[derive(Debug, Clone, PartialEq)]
pub enum BackendOperation {
    /// Query records
    RetrieveMultiple(QueryExpression),
    /// Total record counts per entity
    TotalRecordCount(Vec<String>),
}

impl BackendOperation {
    /// Short name for logs and errors
    pub fn describe(&self) -> String {
        match self {
            BackendOperation::RetrieveMultiple(query) => query.describe(),
            BackendOperation::TotalRecordCount(names) => {
                format!("RetrieveTotalRecordCount({})", names.join(","))
            }
        }
    }
}

/// Result of a [`BackendOperation`]
#[derive(Debug, Clone, PartialEq)]
pub enum BackendResponse {
    /// Records of a query
    Records(Vec<BackendRecord>),
    /// Count per entity
    Counts(HashMap<String, u64>),
}

/// Executes operations against the first connection candidate that works
pub struct BackendGateway {
    client: Arc<dyn BackendClient>,
    candidates: Vec<ConnectionCandidate>,
    attempts: AtomicUsize,
}

impl BackendGateway {
    /// Create a gateway over `candidates`, tried in order
    pub fn new(client: Arc<dyn BackendClient>, candidates: Vec<ConnectionCandidate>) -> Self {
        Self { client, candidates, attempts: AtomicUsize::new(0) }
    }

    /// Candidates this gateway tries
    pub fn candidates(&self) -> &[ConnectionCandidate] {
        &self.candidates
    }

    /// Session attempts made so far
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Execute `operation` on the first candidate that succeeds
    pub async fn execute(&self, operation: &BackendOperation) -> Result<BackendResponse> {
        match operation {
            BackendOperation::RetrieveMultiple(query) => {
                self.retrieve_multiple(query).await.map(BackendResponse::Records)
            }
            BackendOperation::TotalRecordCount(names) => {
                self.total_record_count(names).await.map(BackendResponse::Counts)
            }
        }
    }

    /// Run `query` on the first candidate that succeeds
    pub async fn retrieve_multiple(&self, query: &QueryExpression) -> Result<Vec<BackendRecord>> {
        self.with_failover(query.describe(), |candidate| self.client.retrieve_multiple(candidate, query))
            .await
    }

    /// Fetch total record counts on the first candidate that succeeds
    pub async fn total_record_count(&self, entity_names: &[String]) -> Result<HashMap<String, u64>> {
        let operation = BackendOperation::TotalRecordCount(entity_names.to_vec()).describe();
        self.with_failover(operation, |candidate| {
            self.client.retrieve_total_record_count(candidate, entity_names)
        })
        .await
    }

    async fn with_failover<'a, T, F, Fut>(&'a self, operation: String, mut attempt: F) -> Result<T>
    where
        F: FnMut(&'a ConnectionCandidate) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut tried = 0;

        for candidate in &self.candidates {
            tried += 1;
            self.attempts.fetch_add(1, Ordering::SeqCst);
            debug!("{} on candidate {} ({})", operation, candidate.index, candidate.identifier());

            match attempt(candidate).await {
                Ok(value) => return Ok(value),
                Err(e) => warn!(
                    "{} failed on candidate {} ({}): {}",
                    operation,
                    candidate.index,
                    candidate.identifier(),
                    e
                ),
            }
        }

        warn!("{} failed on all {} candidate(s)", operation, tried);
        Err(CrmTrailError::Unavailable { operation, attempts: tried })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Credential;
    use mockall::mock;

    mock! {
        pub Client {}

        #[async_trait]
        impl BackendClient for Client {
            async fn retrieve_multiple(
                &self,
                candidate: &ConnectionCandidate,
                query: &QueryExpression,
            ) -> Result<Vec<BackendRecord>>;

            async fn retrieve_total_record_count(
                &self,
                candidate: &ConnectionCandidate,
                entity_names: &[String],
            ) -> Result<HashMap<String, u64>>;
        }
    }

    fn candidates(count: usize) -> Vec<ConnectionCandidate> {
        (0..count)
            .map(|index| ConnectionCandidate {
                index,
                endpoint: reqwest::Url::parse("https://org.crm.dynamics.com").unwrap(),
                credential: Credential::ClientSecret {
                    client_id: format!("app-{}", index),
                    client_secret: "secret".into(),
                },
            })
            .collect()
    }

    #[tokio::test]
    async fn test_first_success_wins() {
        let mut client = MockClient::new();
        client
            .expect_retrieve_multiple()
            .times(3)
            .returning(|candidate, _| {
                if candidate.index < 2 {
                    Err(CrmTrailError::Connection(format!("candidate {} rejected", candidate.index)))
                } else {
                    Ok(vec![BackendRecord::new("plugintracelog")])
                }
            });

        let gateway = BackendGateway::new(Arc::new(client), candidates(4));
        let records = gateway.retrieve_multiple(&QueryExpression::new("plugintracelog")).await.unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(gateway.attempts(), 3);
    }

    #[tokio::test]
    async fn test_all_candidates_fail() {
        let mut client = MockClient::new();
        client
            .expect_retrieve_total_record_count()
            .times(2)
            .returning(|_, _| Err(CrmTrailError::Query("throttled".into())));

        let gateway = BackendGateway::new(Arc::new(client), candidates(2));
        let result = gateway.total_record_count(&["account".to_string()]).await;

        match result {
            Err(CrmTrailError::Unavailable { operation, attempts }) => {
                assert_eq!(operation, "RetrieveTotalRecordCount(account)");
                assert_eq!(attempts, 2);
            }
            other => panic!("expected Unavailable, got {:?}", other),
        }
        assert_eq!(gateway.attempts(), 2);
    }

    #[tokio::test]
    async fn test_zero_candidates_never_calls_backend() {
        let mut client = MockClient::new();
        client.expect_retrieve_multiple().never();

        let gateway = BackendGateway::new(Arc::new(client), Vec::new());
        let result = gateway
            .execute(&BackendOperation::RetrieveMultiple(QueryExpression::new("account")))
            .await;

        assert!(matches!(result, Err(CrmTrailError::Unavailable { attempts: 0, .. })));
        assert_eq!(gateway.attempts(), 0);
    }

    #[tokio::test]
    async fn test_execute_dispatches_counts() {
        let mut client = MockClient::new();
        client.expect_retrieve_total_record_count().times(1).returning(|_, names| {
            Ok(names.iter().map(|name| (name.clone(), 7)).collect())
        });

        let gateway = BackendGateway::new(Arc::new(client), candidates(1));
        let response = gateway
            .execute(&BackendOperation::TotalRecordCount(vec!["contact".into()]))
            .await
            .unwrap();

        assert_eq!(response, BackendResponse::Counts(HashMap::from([("contact".to_string(), 7)])));
    }
}
