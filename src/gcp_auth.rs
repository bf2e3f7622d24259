// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use anyhow::{anyhow, Context};
use log::debug;
use std::fs;
use std::path::PathBuf;

use crate::constants;
use crate::constants::CREDENTIALS_FILE;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug)]
pub(crate) struct AccessTokenResponse {
    pub access_token: String,
    pub expires_in: i64,
    token_type: String,
}

fn credentials_path() -> anyhow::Result<PathBuf> {
    let home = std::env::var("HOME").context("couldn't find HOME")?;
    Ok(PathBuf::from(home).join(CREDENTIALS_FILE))
}

pub async fn get_access_token() -> anyhow::Result<String> {
    let credentials = credentials_path()?;
    if fs::exists(&credentials)? {
        debug!("using user credentials");
        fetch_user_access_token(&credentials).await
    } else {
        debug!("fetching credentials from metadata server");
        Ok(reqwest::Client::new()
            .get(constants::DEFAULT_TOKEN_URI)
            .header("Metadata-Flavor", "Google")
            .send()
            .await?
            .error_for_status()?
            .json::<AccessTokenResponse>()
            .await?
            .access_token)
    }
}

pub(crate) async fn get_project_id(project_id: &str) -> anyhow::Result<String> {
    if !project_id.is_empty() {
        return Ok(project_id.to_string());
    }
    debug!("fetching project id from metadata server");
    Ok(reqwest::Client::new()
        .get(constants::PROJECT_ID_URI)
        .header("Metadata-Flavor", "Google")
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?)
}

pub async fn get_region(region: &str) -> anyhow::Result<String> {
    if !region.is_empty() {
        return Ok(region.to_string());
    }
    debug!("fetching zone from metadata server");
    let zone = reqwest::Client::new()
        .get(constants::INSTANCE_ZONE_URI)
        .header("Metadata-Flavor", "Google")
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;
    region_from_zone(&zone)
}

pub(crate) fn region_from_zone(zone: &str) -> anyhow::Result<String> {
    let re = Regex::new(r"^(projects/\d+/zones/)?(?P<region>[a-z0-9]+-[a-z0-9]+)-[a-z]$")?;
    match re.captures(zone) {
        Some(caps) => Ok(String::from(&caps["region"])),
        None => Err(anyhow!(
            "error occurred fetching region from zone: {}",
            zone
        )),
    }
}

#[derive(Serialize, Deserialize, Debug)]
struct RefreshTokenRequest {
    client_id: String,
    client_secret: String,
    #[serde(rename(deserialize = "type"))]
    grant_type: String,
    refresh_token: String,
}

pub(crate) async fn fetch_user_access_token(credentials: &PathBuf) -> anyhow::Result<String> {
    let mut payload: RefreshTokenRequest = serde_json::from_str(
        &fs::read_to_string(credentials)
            .with_context(|| format!("failed to read {}", credentials.display()))?,
    )?;
    payload.grant_type = String::from("refresh_token");
    Ok(reqwest::Client::new()
        .post(constants::GCP_TOKEN_URI)
        .header("content-type", "application/json")
        .body(serde_json::to_string(&payload)?)
        .send()
        .await?
        .error_for_status()?
        .json::<AccessTokenResponse>()
        .await?
        .access_token)
}
