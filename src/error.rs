use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("invalid node: {0}")]
    InvalidNode(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("upstream failure: {0}")]
    Upstream(anyhow::Error),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("graph generation timed out after {0:?}")]
    Timeout(Duration),
}

impl From<anyhow::Error> for GraphError {
    fn from(error: anyhow::Error) -> GraphError {
        GraphError::Upstream(error)
    }
}

impl GraphError {
    pub fn is_upstream(&self) -> bool {
        matches!(self, GraphError::Upstream(_))
    }
}

pub type Result<T, E = GraphError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anyhow_converts_to_upstream() {
        fn fetch() -> Result<()> {
            let failed: anyhow::Result<()> = Err(anyhow::anyhow!("connection refused"));
            failed?;
            Ok(())
        }

        let err = fetch().unwrap_err();
        assert!(err.is_upstream());
        assert_eq!(err.to_string(), "upstream failure: connection refused");
    }
}
