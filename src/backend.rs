use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::budget::RequestBudget;
use crate::cache::{Cache, CachePolicy};
use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::geo::{Coordinates, HarvestPoint};
use crate::http::HttpClient;
use crate::place::PlaceRecord;
use crate::places::PlacesClient;
use crate::profile::SearchProfile;
use crate::routes::{TravelClient, TravelTarget};

/// The two network operations the pipeline depends on.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    async fn search_all(
        &self,
        query: &str,
        point: &HarvestPoint,
        type_filter: Option<&str>,
        max_pages: usize,
        radius_m: Option<u32>,
    ) -> AppResult<Vec<PlaceRecord>>;

    async fn compute_duration(
        &self,
        origin_id: &str,
        origin: Coordinates,
        target: TravelTarget<'_>,
        departure: DateTime<Utc>,
        mode: &str,
    ) -> AppResult<Option<u64>>;
}

/// Network-backed backend sharing one HTTP client, cache and budget.
pub struct ApiBackend {
    places: PlacesClient,
    travel: TravelClient,
}

impl ApiBackend {
    pub fn new(places: PlacesClient, travel: TravelClient) -> Self {
        Self { places, travel }
    }

    pub fn from_config(
        config: &AppConfig,
        profile: &SearchProfile,
        cache: Arc<Cache>,
        budget: Arc<RequestBudget>,
    ) -> AppResult<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| AppError::config("GOOGLE_MAPS_API_KEY is required for network runs"))?;
        let http = HttpClient::new(api_key, config.http.clone())?;
        let places = PlacesClient::new(
            http.clone(),
            Arc::clone(&cache),
            Arc::clone(&budget),
            config.places_text_search_url.clone(),
            profile.harvest.bias_radius_m,
            CachePolicy {
                no_cache: config.no_cache,
                refresh: config.refresh_search,
            },
        );
        let travel = TravelClient::new(
            http,
            cache,
            budget,
            config.routes_compute_url.clone(),
            &profile.travel,
            CachePolicy {
                no_cache: config.no_cache,
                refresh: config.refresh_travel,
            },
        )?;
        Ok(Self::new(places, travel))
    }
}

#[async_trait]
impl SearchBackend for ApiBackend {
    async fn search_all(
        &self,
        query: &str,
        point: &HarvestPoint,
        type_filter: Option<&str>,
        max_pages: usize,
        radius_m: Option<u32>,
    ) -> AppResult<Vec<PlaceRecord>> {
        self.places
            .search_all(query, point, type_filter, max_pages, radius_m)
            .await
    }

    async fn compute_duration(
        &self,
        origin_id: &str,
        origin: Coordinates,
        target: TravelTarget<'_>,
        departure: DateTime<Utc>,
        mode: &str,
    ) -> AppResult<Option<u64>> {
        self.travel
            .compute_duration(origin_id, origin, target, departure, mode)
            .await
    }
}
