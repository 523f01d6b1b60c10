use serde::{Deserialize, Serialize};

/// Location resolved for a client IP address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geolocation {
    pub ip_address: String,
    pub city: Option<String>,
    pub region: Option<String>,
    pub country: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl Geolocation {
    /// Placeholder stored for IPs no lookup has resolved yet.
    pub fn unknown(ip_address: impl Into<String>) -> Self {
        Self {
            ip_address: ip_address.into(),
            city: None,
            region: None,
            country: "Unknown".into(),
            latitude: 0.0,
            longitude: 0.0,
        }
    }
}
