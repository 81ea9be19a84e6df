use reqwest::Client;
use std::future::Future;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::config::{Config, PeerConfig};
use crate::error::{DeviceError, DeviceResult};
use crate::types::{Action, Direction, ScanResult};

/// A validated settings change for the local device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsRequest {
    pub turns_per_day: u32,
    pub turn_duration: u32,
    pub direction: Direction,
    pub action: Option<Action>,
}

impl SettingsRequest {
    pub fn new(
        turns_per_day: i64,
        turn_duration: i64,
        direction: &str,
        action: Option<Action>,
    ) -> DeviceResult<Self> {
        Ok(Self {
            turns_per_day: positive("turns per day", turns_per_day)?,
            turn_duration: positive("turn duration", turn_duration)?,
            direction: direction.parse()?,
            action,
        })
    }

    fn query(&self) -> Vec<(&'static str, String)> {
        let mut query = vec![
            ("tpd", self.turns_per_day.to_string()),
            ("duration", self.turn_duration.to_string()),
            ("dir", self.direction.as_str().to_string()),
        ];
        if let Some(action) = self.action {
            query.push(("action", action.as_str().to_string()));
        }
        query
    }
}

fn positive(what: &str, value: i64) -> DeviceResult<u32> {
    u32::try_from(value)
        .ok()
        .filter(|v| *v > 0)
        .ok_or_else(|| {
            DeviceError::Validation(format!("{what} must be a positive integer, got {value}"))
        })
}

/// Request/response side of the device protocol.
pub trait DeviceTransport: Clone + Send + Sync + 'static {
    fn apply_settings(
        &self,
        request: &SettingsRequest,
    ) -> impl Future<Output = DeviceResult<String>> + Send;

    fn add_peer(&self, name: &str) -> impl Future<Output = DeviceResult<String>> + Send;

    /// Talks to the peer directly, never through the local device.
    fn control_peer(
        &self,
        peer: &str,
        action: Action,
    ) -> impl Future<Output = DeviceResult<String>> + Send;

    fn scan_networks(&self) -> impl Future<Output = DeviceResult<ScanResult>> + Send;

    fn save_wifi(
        &self,
        ssid: &str,
        password: &str,
    ) -> impl Future<Output = DeviceResult<String>> + Send;

    fn save_device_name(&self, name: &str) -> impl Future<Output = DeviceResult<String>> + Send;
}

#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
    peers: PeerConfig,
}

impl HttpTransport {
    pub fn new(
        base_url: impl Into<String>,
        peers: PeerConfig,
        request_timeout: Duration,
    ) -> DeviceResult<Self> {
        let client = Client::builder()
            .user_agent("horus/0.2")
            .connect_timeout(Duration::from_secs(5))
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            peers,
        })
    }

    pub fn from_config(config: &Config) -> DeviceResult<Self> {
        Self::new(
            config.device.http_base(),
            config.peers.clone(),
            config.connection.request_timeout(),
        )
    }

    /// `http://<peer>.local/set` with the default peer settings.
    pub fn peer_url(&self, peer: &str) -> DeviceResult<Url> {
        let valid = !peer.is_empty()
            && peer
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(DeviceError::Peer {
                peer: peer.to_string(),
                reason: "not a valid host name".to_string(),
            });
        }

        let mut address = format!("{}://{}{}", self.peers.scheme, peer, self.peers.host_suffix);
        if let Some(port) = self.peers.port {
            address.push_str(&format!(":{port}"));
        }
        let mut url = Url::parse(&address).map_err(|e| DeviceError::Peer {
            peer: peer.to_string(),
            reason: e.to_string(),
        })?;
        url.set_path("/set");
        Ok(url)
    }

    async fn read_text(response: reqwest::Response) -> DeviceResult<String> {
        let response = response.error_for_status()?;
        Ok(response.text().await?)
    }
}

impl DeviceTransport for HttpTransport {
    async fn apply_settings(&self, request: &SettingsRequest) -> DeviceResult<String> {
        let response = self
            .client
            .get(format!("{}/set", self.base_url))
            .query(&request.query())
            .send()
            .await?;
        let body = Self::read_text(response).await?;
        debug!("Settings response: {}", body);
        Ok(body)
    }

    async fn add_peer(&self, name: &str) -> DeviceResult<String> {
        let result: DeviceResult<String> = async {
            let response = self
                .client
                .post(format!("{}/add_other_horus", self.base_url))
                .form(&[("mdns_name", name)])
                .send()
                .await?;
            Self::read_text(response).await
        }
        .await;

        result.map_err(|e| DeviceError::AddPeer {
            peer: name.to_string(),
            reason: e.to_string(),
        })
    }

    async fn control_peer(&self, peer: &str, action: Action) -> DeviceResult<String> {
        let mut url = self.peer_url(peer)?;
        url.query_pairs_mut().append_pair("action", action.as_str());

        let result: DeviceResult<String> = async {
            let response = self.client.get(url).send().await?;
            Self::read_text(response).await
        }
        .await;

        result.map_err(|e| DeviceError::Peer {
            peer: peer.to_string(),
            reason: e.to_string(),
        })
    }

    async fn scan_networks(&self) -> DeviceResult<ScanResult> {
        let response = self
            .client
            .get(format!("{}/scan", self.base_url))
            .send()
            .await?
            .error_for_status()?;
        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn save_wifi(&self, ssid: &str, password: &str) -> DeviceResult<String> {
        let response = self
            .client
            .post(format!("{}/save_wifi", self.base_url))
            .form(&[("ssid", ssid), ("password", password)])
            .send()
            .await?;
        Self::read_text(response).await
    }

    async fn save_device_name(&self, name: &str) -> DeviceResult<String> {
        let response = self
            .client
            .post(format!("{}/save_wifi", self.base_url))
            .form(&[("name", name)])
            .send()
            .await?;
        Self::read_text(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn transport(server: &MockServer) -> HttpTransport {
        let peers = PeerConfig {
            scheme: "http".to_string(),
            host_suffix: String::new(),
            port: Some(server.address().port()),
        };
        HttpTransport::new(server.uri(), peers, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn settings_validation_rejects_bad_input() {
        assert!(SettingsRequest::new(5, 30, "Both", None).is_ok());
        assert!(matches!(
            SettingsRequest::new(0, 30, "Both", None),
            Err(DeviceError::Validation(_))
        ));
        assert!(matches!(
            SettingsRequest::new(5, -1, "Both", None),
            Err(DeviceError::Validation(_))
        ));
        assert!(matches!(
            SettingsRequest::new(5, 30, "Up", None),
            Err(DeviceError::Validation(_))
        ));
    }

    #[test]
    fn transport_builds_from_default_config() {
        let transport = HttpTransport::from_config(&Config::default()).unwrap();
        assert_eq!(transport.base_url, "http://horus.local");
    }

    #[test]
    fn peer_url_uses_mdns_name() {
        let transport = HttpTransport::new(
            "http://horus.local",
            PeerConfig::default(),
            Duration::from_secs(5),
        )
        .unwrap();
        let url = transport.peer_url("horus-ABCD").unwrap();
        assert_eq!(url.as_str(), "http://horus-abcd.local/set");
        assert!(matches!(
            transport.peer_url("evil/../x"),
            Err(DeviceError::Peer { .. })
        ));
        assert!(transport.peer_url("").is_err());
    }

    #[tokio::test]
    async fn apply_settings_encodes_all_fields() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/set"))
            .and(query_param("tpd", "5"))
            .and(query_param("duration", "30"))
            .and(query_param("dir", "Both"))
            .and(query_param("action", "start"))
            .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
            .expect(1)
            .mount(&server)
            .await;

        let request = SettingsRequest::new(5, 30, "Both", Some(Action::Start)).unwrap();
        let body = transport(&server).apply_settings(&request).await.unwrap();
        assert_eq!(body, "OK");
    }

    #[tokio::test]
    async fn add_peer_posts_form_and_maps_failures() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/add_other_horus"))
            .and(body_string("mdns_name=horus-XYZ"))
            .respond_with(ResponseTemplate::new(200).set_body_string("added"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/add_other_horus"))
            .and(body_string("mdns_name=broken"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let transport = transport(&server);
        assert_eq!(transport.add_peer("horus-XYZ").await.unwrap(), "added");
        let err = transport.add_peer("broken").await.unwrap_err();
        assert!(matches!(err, DeviceError::AddPeer { .. }));
        assert!(!err.is_connectivity());
    }

    #[tokio::test]
    async fn control_peer_goes_to_the_peer_address() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/set"))
            .and(query_param("action", "stop"))
            .respond_with(ResponseTemplate::new(200).set_body_string("stopped"))
            .expect(1)
            .mount(&server)
            .await;

        let body = transport(&server)
            .control_peer("127.0.0.1", Action::Stop)
            .await
            .unwrap();
        assert_eq!(body, "stopped");
    }

    #[tokio::test]
    async fn scan_networks_parses_entries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/scan"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "networks": [
                    {"ssid": "home", "rssi": -48},
                    {"ssid": "garage", "rssi": -80}
                ]
            })))
            .mount(&server)
            .await;

        let result = transport(&server).scan_networks().await.unwrap();
        assert_eq!(result.networks.len(), 2);
        assert_eq!(result.networks[0].ssid, "home");
        assert_eq!(result.networks[1].rssi, -80);
    }

    #[tokio::test]
    async fn device_name_is_saved_through_wifi_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/save_wifi"))
            .and(body_string("name=Kitchen"))
            .respond_with(ResponseTemplate::new(200).set_body_string("saved"))
            .expect(1)
            .mount(&server)
            .await;

        let body = transport(&server).save_device_name("Kitchen").await.unwrap();
        assert_eq!(body, "saved");
    }

    #[tokio::test]
    async fn server_errors_surface_as_network_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/set"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let request = SettingsRequest::new(1, 10, "Forward", None).unwrap();
        let err = transport(&server).apply_settings(&request).await.unwrap_err();
        assert!(matches!(err, DeviceError::Network(_)));
    }
}
