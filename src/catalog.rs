use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ApiError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Game {
    pub app_id: String,
    pub title: String,
}

/// Where the owned-games list comes from.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// A full listing in the source's own order. Outages map to `Unavailable`.
    async fn fetch_games(&self) -> Result<Vec<Game>, ApiError>;
}

pub struct CatalogService {
    source: Arc<dyn CatalogSource>,
}

impl CatalogService {
    pub fn new(source: Arc<dyn CatalogSource>) -> Self {
        Self { source }
    }

    /// Fresh snapshot; nothing is cached or merged between calls.
    pub async fn list_games(&self) -> Result<Vec<Game>, ApiError> {
        let games = self.source.fetch_games().await.map_err(|e| match e {
            ApiError::Unavailable(_) | ApiError::Auth(_) => e,
            other => ApiError::unavailable(other.to_string()),
        })?;
        log::debug!("catalog returned {} games", games.len());
        Ok(games)
    }

    pub async fn find(&self, app_id: &str) -> Result<Option<Game>, ApiError> {
        Ok(self
            .list_games()
            .await?
            .into_iter()
            .find(|g| g.app_id == app_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Result<Vec<Game>, ApiError>);

    #[async_trait]
    impl CatalogSource for Fixed {
        async fn fetch_games(&self) -> Result<Vec<Game>, ApiError> {
            self.0.clone()
        }
    }

    fn game(id: &str, title: &str) -> Game {
        Game {
            app_id: id.to_string(),
            title: title.to_string(),
        }
    }

    #[tokio::test]
    async fn keeps_source_order() {
        let svc = CatalogService::new(Arc::new(Fixed(Ok(vec![
            game("Sugar", "Rocket League"),
            game("Fortnite", "Fortnite"),
        ]))));
        let ids: Vec<_> = svc
            .list_games()
            .await
            .unwrap()
            .into_iter()
            .map(|g| g.app_id)
            .collect();
        assert_eq!(ids, vec!["Sugar", "Fortnite"]);
        assert_eq!(
            svc.find("Fortnite").await.unwrap(),
            Some(game("Fortnite", "Fortnite"))
        );
        assert_eq!(svc.find("Nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn source_failures_become_unavailable() {
        let svc = CatalogService::new(Arc::new(Fixed(Err(ApiError::install("boom")))));
        assert!(matches!(svc.list_games().await, Err(ApiError::Unavailable(_))));
    }
}
