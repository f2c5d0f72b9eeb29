// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP client for a shared lease service.
//!
//! The service exposes one lease per worker:
//!
//! - `PUT    /v1/leases/<worker>`        register, body `{"ttl_secs": N}`
//! - `POST   /v1/leases/<worker>/renew`  renew, 404 means the lease lapsed
//! - `DELETE /v1/leases/<worker>`        deregister
//! - `GET    /v1/members`                live workers, `{"members": [...]}`

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::coordination::{Coordination, CoordinationError, Lease, WorkerId};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct HttpCoordination {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct RegisterBody {
    ttl_secs: u64,
}

#[derive(Deserialize)]
struct LeaseBody {
    ttl_secs: u64,
}

#[derive(Deserialize)]
struct MembersBody {
    members: Vec<WorkerId>,
}

impl HttpCoordination {
    pub fn new(base_url: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    fn lease_url(&self, worker: &WorkerId) -> String {
        format!("{}/v1/leases/{}", self.base_url, worker)
    }
}

fn transport_error(err: reqwest::Error) -> CoordinationError {
    CoordinationError::Unavailable(err.to_string())
}

fn status_error(status: reqwest::StatusCode) -> CoordinationError {
    CoordinationError::Unavailable(format!("lease service returned status {status}"))
}

#[async_trait]
impl Coordination for HttpCoordination {
    async fn register(
        &self,
        worker: &WorkerId,
        ttl: Duration,
    ) -> Result<Lease, CoordinationError> {
        let response = self
            .client
            .put(self.lease_url(worker))
            .json(&RegisterBody {
                ttl_secs: ttl.as_secs(),
            })
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(status_error(response.status()));
        }
        let body: LeaseBody = response.json().await.map_err(transport_error)?;
        Ok(Lease::granted(Duration::from_secs(body.ttl_secs)))
    }

    async fn renew(&self, worker: &WorkerId) -> Result<Lease, CoordinationError> {
        let response = self
            .client
            .post(format!("{}/renew", self.lease_url(worker)))
            .send()
            .await
            .map_err(transport_error)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(CoordinationError::LeaseExpired(worker.clone()));
        }
        if !response.status().is_success() {
            return Err(status_error(response.status()));
        }
        let body: LeaseBody = response.json().await.map_err(transport_error)?;
        Ok(Lease::granted(Duration::from_secs(body.ttl_secs)))
    }

    async fn deregister(&self, worker: &WorkerId) -> Result<(), CoordinationError> {
        let response = self
            .client
            .delete(self.lease_url(worker))
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(status_error(response.status()));
        }
        Ok(())
    }

    async fn members(&self) -> Result<Vec<WorkerId>, CoordinationError> {
        let response = self
            .client
            .get(format!("{}/v1/members", self.base_url))
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(status_error(response.status()));
        }
        let mut body: MembersBody = response.json().await.map_err(transport_error)?;
        body.members.sort();
        Ok(body.members)
    }
}
