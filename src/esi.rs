use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::error::Error;
use std::time::Duration;

use crate::models::EntityCategory;

pub const DEFAULT_ESI_URL: &str = "https://esi.evetech.net/latest/";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize, Clone)]
pub struct EsiSolarSystem {
    pub name: String,
    pub security_status: f64,
    pub constellation_id: u32,
    pub position: EsiPosition,
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct EsiPosition {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EsiConstellation {
    pub name: String,
    pub region_id: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EsiRegion {
    pub name: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EsiType {
    pub name: String,
    pub group_id: u32,
    #[serde(default)]
    pub published: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EsiGroup {
    pub name: String,
    pub category_id: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EsiName {
    pub id: u64,
    pub name: String,
    pub category: EntityCategory,
}

#[derive(Clone)]
pub struct EsiClient {
    client: Client,
    base_url: String,
}

impl Default for EsiClient {
    fn default() -> Self {
        Self::new(DEFAULT_ESI_URL)
    }
}

impl EsiClient {
    pub fn new(base_url: &str) -> Self {
        EsiClient {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string() + "/",
        }
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<T, Box<dyn Error + Send + Sync>> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(format!("ESI returned status {} for {}", response.status(), url).into());
        }
        let data: T = response.json().await?;
        Ok(data)
    }

    pub async fn get_solar_system(
        &self,
        system_id: u32,
    ) -> Result<EsiSolarSystem, Box<dyn Error + Send + Sync>> {
        self.fetch(&format!("universe/systems/{}/", system_id)).await
    }

    pub async fn get_constellation(
        &self,
        constellation_id: u32,
    ) -> Result<EsiConstellation, Box<dyn Error + Send + Sync>> {
        self.fetch(&format!("universe/constellations/{}/", constellation_id))
            .await
    }

    pub async fn get_region(
        &self,
        region_id: u32,
    ) -> Result<EsiRegion, Box<dyn Error + Send + Sync>> {
        self.fetch(&format!("universe/regions/{}/", region_id)).await
    }

    pub async fn get_type(&self, type_id: u32) -> Result<EsiType, Box<dyn Error + Send + Sync>> {
        self.fetch(&format!("universe/types/{}/", type_id)).await
    }

    pub async fn get_group(&self, group_id: u32) -> Result<EsiGroup, Box<dyn Error + Send + Sync>> {
        self.fetch(&format!("universe/groups/{}/", group_id)).await
    }

    /// Shortest route between two systems as the list of system ids on the
    /// path, origin and destination included. A 404 means no route exists.
    pub async fn get_route(
        &self,
        origin_id: u32,
        destination_id: u32,
    ) -> Result<Option<Vec<u32>>, Box<dyn Error + Send + Sync>> {
        let url = format!("{}route/{}/{}/", self.base_url, origin_id, destination_id);
        let response = self
            .client
            .get(&url)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(format!("ESI returned status {} for {}", response.status(), url).into());
        }
        let route: Vec<u32> = response.json().await?;
        Ok(Some(route))
    }

    /// Bulk id-to-name resolution via `universe/names`. Ids ESI cannot
    /// resolve are simply absent from the result.
    pub async fn get_names(
        &self,
        ids: &[u64],
    ) -> Result<Vec<EsiName>, Box<dyn Error + Send + Sync>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}universe/names/", self.base_url);
        let response = self
            .client
            .post(&url)
            .timeout(REQUEST_TIMEOUT)
            .json(&ids)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(format!("ESI returned status {} for {}", response.status(), url).into());
        }
        let names: Vec<EsiName> = response.json().await?;
        Ok(names)
    }

    /// Full killmail body for a point lookup; the hash comes from the zkb API.
    pub async fn get_killmail(
        &self,
        killmail_id: i64,
        hash: &str,
    ) -> Result<serde_json::Value, Box<dyn Error + Send + Sync>> {
        self.fetch(&format!("killmails/{}/{}/", killmail_id, hash))
            .await
    }
}
