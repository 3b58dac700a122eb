//! Power meter readings polled from HTTP endpoints returning JSON.
//!
//! A dedicated task polls at the configured interval. A failed poll does not
//! update any value, but the poll timestamp still advances so the cadence is
//! preserved. Readings of one poll are collected into a fresh container and
//! merged atomically after all requests succeeded.

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Label, Provider, SharedDataPoints};
use crate::config::{PowerMeterHttpJsonConfig, PowerMeterHttpJsonValue};
use crate::datapoints::DataPointContainer;
use crate::mqtt::numeric_from_payload;
use crate::uptime;

pub struct HttpJsonProvider {
    config: PowerMeterHttpJsonConfig,
    data: SharedDataPoints,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl HttpJsonProvider {
    pub fn new(config: PowerMeterHttpJsonConfig) -> Self {
        Self {
            config,
            data: Arc::new(Mutex::new(DataPointContainer::new())),
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    async fn fetch(client: &reqwest::Client, value: &PowerMeterHttpJsonValue) -> anyhow::Result<String> {
        let mut request = client.get(&value.url);
        if let Some(username) = &value.username {
            request = request.basic_auth(username, value.password.as_deref());
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("request to {} failed", value.url))?
            .error_for_status()
            .with_context(|| format!("request to {} was rejected", value.url))?;

        Ok(response.text().await?)
    }

    fn decode(value: &PowerMeterHttpJsonValue, body: &str) -> anyhow::Result<f32> {
        let raw = numeric_from_payload(body.as_bytes(), value.json_path.as_deref())?;
        let mut watts = value.unit.to_watts(raw);
        if value.sign_inverted {
            watts = -watts;
        }
        Ok(watts)
    }

    fn store_phase(container: &mut DataPointContainer<Label>, phase: usize, watts: f32) {
        match phase {
            0 => container.add::<super::PowerL1>(watts),
            1 => container.add::<super::PowerL2>(watts),
            2 => container.add::<super::PowerL3>(watts),
            _ => {}
        }
    }

    async fn poll(
        client: &reqwest::Client,
        config: &PowerMeterHttpJsonConfig,
    ) -> anyhow::Result<DataPointContainer<Label>> {
        let mut container = DataPointContainer::new();

        let values: Vec<(usize, &PowerMeterHttpJsonValue)> = config
            .values
            .iter()
            .take(3)
            .enumerate()
            .filter(|(_, value)| value.enabled && !value.url.is_empty())
            .collect();

        anyhow::ensure!(!values.is_empty(), "no HTTP values configured");

        if config.individual_requests {
            for (phase, value) in values {
                let body = Self::fetch(client, value).await?;
                Self::store_phase(&mut container, phase, Self::decode(value, &body)?);
            }
        } else {
            // one request; every enabled value addresses the same document
            let (_, first) = values[0];
            let body = Self::fetch(client, first).await?;
            for (phase, value) in values {
                Self::store_phase(&mut container, phase, Self::decode(value, &body)?);
            }
        }

        Ok(container)
    }
}

#[async_trait]
impl Provider for HttpJsonProvider {
    async fn init(&mut self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.config
                .values
                .iter()
                .any(|value| value.enabled && !value.url.is_empty()),
            "no HTTP power meter values configured"
        );

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.config.request_timeout_secs))
            .build()
            .context("building HTTP client")?;

        let config = self.config.clone();
        let data = Arc::clone(&self.data);
        let cancel = self.cancel.clone();

        self.task = Some(tokio::spawn(async move {
            let interval_millis = config.polling_interval_secs as u32 * 1000;
            let mut last_poll: u32 = 0;

            loop {
                let now = uptime::millis();
                let elapsed = uptime::elapsed(now, last_poll);
                if last_poll > 0 && elapsed < interval_millis {
                    let remaining = Duration::from_millis((interval_millis - elapsed) as u64);
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(remaining) => {}
                    }
                    continue;
                }

                if cancel.is_cancelled() {
                    return;
                }

                last_poll = uptime::millis();

                match Self::poll(&client, &config).await {
                    Ok(container) => {
                        let mut data = data.lock();
                        data.merge(&container);
                        debug!("power meter HTTP poll complete");
                    }
                    Err(e) => warn!(error = %e, "power meter HTTP poll failed"),
                }
            }
        }));

        Ok(())
    }

    async fn deinit(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    fn data(&self) -> &SharedDataPoints {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PowerUnit;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn value_for(url: String, json_path: &str) -> PowerMeterHttpJsonValue {
        PowerMeterHttpJsonValue {
            url,
            json_path: Some(json_path.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn polls_and_merges_readings() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/meter"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"power": {"l1": 120.5, "l2": -60.0}}"#,
            ))
            .mount(&server)
            .await;

        let config = PowerMeterHttpJsonConfig {
            polling_interval_secs: 30,
            values: vec![
                value_for(format!("{}/meter", server.uri()), "power.l1"),
                value_for(format!("{}/meter", server.uri()), "power.l2"),
            ],
            ..Default::default()
        };

        let mut provider = HttpJsonProvider::new(config);
        provider.init().await.unwrap();

        // first poll happens immediately; give the task a moment
        for _ in 0..50 {
            if provider.last_update() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(provider.power_total(), 60.5);
        provider.deinit().await;
    }

    #[tokio::test]
    async fn failed_poll_keeps_old_data() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/meter"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let config = PowerMeterHttpJsonConfig {
            polling_interval_secs: 30,
            values: vec![value_for(format!("{}/meter", server.uri()), "power")],
            ..Default::default()
        };

        let mut provider = HttpJsonProvider::new(config);
        provider.init().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(provider.last_update(), 0);
        assert!(!provider.is_data_valid());
        provider.deinit().await;
    }

    #[test]
    fn decode_applies_unit_and_sign() {
        let value = PowerMeterHttpJsonValue {
            unit: PowerUnit::KiloWatts,
            sign_inverted: true,
            json_path: Some("p".to_string()),
            ..Default::default()
        };
        let watts = HttpJsonProvider::decode(&value, r#"{"p": 1.2}"#).unwrap();
        assert!((watts + 1200.0).abs() < 0.01);
    }

    #[tokio::test]
    async fn init_rejects_empty_config() {
        let mut provider = HttpJsonProvider::new(PowerMeterHttpJsonConfig::default());
        assert!(provider.init().await.is_err());
    }
}
