use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// One packet summary as emitted by the capture process.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct PacketEvent {
    pub transport: Transport,
    pub size: u64,
    /// Capture timestamp in milliseconds since the epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Transport {
    Ipv4 {
        source: String,
        dest: String,
    },
    Ipv6,
    Arp {
        /// Opcode, either numeric or symbolic depending on the capture build.
        #[serde(default)]
        op: serde_json::Value,
    },
    Ethernet {
        #[serde(default)]
        proto: Option<u16>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize)]
struct SizeOnly {
    size: u64,
}

impl PacketEvent {
    pub fn ipv4(source: impl Into<String>, dest: impl Into<String>, size: u64) -> Self {
        Self {
            transport: Transport::Ipv4 {
                source: source.into(),
                dest: dest.into(),
            },
            size,
            time: None,
        }
    }

    /// Decodes one event. A record whose transport cannot be understood but
    /// which still carries a size decodes as `Transport::Unknown`.
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        match serde_json::from_slice::<Self>(bytes) {
            Ok(event) => Ok(event),
            Err(err) => match serde_json::from_slice::<SizeOnly>(bytes) {
                Ok(SizeOnly { size }) => Ok(Self {
                    transport: Transport::Unknown,
                    size,
                    time: None,
                }),
                Err(_) => Err(err),
            },
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GeoStatus {
    Success,
    #[default]
    #[serde(alias = "fail")]
    Failed,
}

/// Geolocation of one address, in the ip-api.com response shape.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GeoRecord {
    pub query: String,
    pub status: GeoStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub country: String,
    pub country_code: String,
    pub region: String,
    pub region_name: String,
    pub city: String,
    pub zip: String,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub timezone: String,
    pub isp: String,
    pub org: String,
    #[serde(rename = "as")]
    pub as_name: String,
}

impl GeoRecord {
    pub fn failed(query: &str, message: impl Into<String>) -> Self {
        Self {
            query: query.to_string(),
            status: GeoStatus::Failed,
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == GeoStatus::Success
    }

    /// `(lat, lon)` when the lookup succeeded with finite coordinates.
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        if !self.is_success() {
            return None;
        }
        match (self.lat, self.lon) {
            (Some(lat), Some(lon)) if lat.is_finite() && lon.is_finite() => Some((lat, lon)),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsoleLine {
    pub id: u64,
    pub text: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TopTalkers {
    /// Descending by byte count.
    pub entries: Vec<(String, u64)>,
    pub total_bytes: u64,
}

#[derive(Clone, Debug)]
pub struct MapPoint {
    pub record: Arc<GeoRecord>,
    pub traffic: u64,
    pub lat: f64,
    pub lon: f64,
}

impl MapPoint {
    pub fn from_record(record: Arc<GeoRecord>, traffic: u64) -> Option<Self> {
        let (lat, lon) = record.coordinates()?;
        Some(Self {
            record,
            traffic,
            lat,
            lon,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_capture_shapes() {
        let ipv4 = PacketEvent::from_json(
            br#"{ "time":1700000000000, "transport":{ "type": "ipv4", "source": "10.0.0.1", "dest": "10.0.0.2" }, "size":74 }"#,
        )
        .unwrap();
        assert_eq!(ipv4.size, 74);
        assert_eq!(ipv4.time, Some(1_700_000_000_000));
        assert_eq!(
            ipv4.transport,
            Transport::Ipv4 {
                source: "10.0.0.1".into(),
                dest: "10.0.0.2".into()
            }
        );

        let arp =
            PacketEvent::from_json(br#"{"transport":{"type":"arp","op":1},"size":42}"#).unwrap();
        assert!(matches!(arp.transport, Transport::Arp { .. }));

        let arp_named =
            PacketEvent::from_json(br#"{"transport":{"type":"arp","op":"request"},"size":42}"#)
                .unwrap();
        assert!(matches!(arp_named.transport, Transport::Arp { .. }));

        let v6 = PacketEvent::from_json(br#"{"transport":{"type":"ipv6"},"size":90}"#).unwrap();
        assert_eq!(v6.transport, Transport::Ipv6);
    }

    #[test]
    fn unknown_or_broken_transport_keeps_size() {
        let unknown =
            PacketEvent::from_json(br#"{"transport":{"type":"sctp"},"size":12}"#).unwrap();
        assert_eq!(unknown.transport, Transport::Unknown);
        assert_eq!(unknown.size, 12);

        let broken =
            PacketEvent::from_json(br#"{"transport":{"type":"ipv4"},"size":33}"#).unwrap();
        assert_eq!(broken.transport, Transport::Unknown);
        assert_eq!(broken.size, 33);

        assert!(PacketEvent::from_json(br#"{"transport":{"type":"ipv4"}}"#).is_err());
        assert!(PacketEvent::from_json(b"not json").is_err());
    }

    #[test]
    fn geo_record_accepts_both_failure_spellings() {
        let failed: GeoRecord =
            serde_json::from_str(r#"{"status":"fail","message":"private range","query":"10.0.0.1"}"#)
                .unwrap();
        assert_eq!(failed.status, GeoStatus::Failed);
        assert_eq!(failed.message.as_deref(), Some("private range"));
        assert!(failed.coordinates().is_none());

        let ok: GeoRecord = serde_json::from_str(
            r#"{"query":"8.8.8.8","status":"success","country":"United States","countryCode":"US",
                "region":"VA","regionName":"Virginia","city":"Ashburn","zip":"20149",
                "lat":39.03,"lon":-77.5,"timezone":"America/New_York","isp":"Google LLC",
                "org":"Google Public DNS","as":"AS15169 Google LLC"}"#,
        )
        .unwrap();
        assert_eq!(ok.country_code, "US");
        assert_eq!(ok.as_name, "AS15169 Google LLC");
        assert_eq!(ok.coordinates(), Some((39.03, -77.5)));
        assert_eq!(
            serde_json::to_value(GeoRecord::failed("1.1.1.1", "x")).unwrap()["status"],
            "failed"
        );
    }

    #[test]
    fn map_point_requires_coordinates() {
        let record = Arc::new(GeoRecord {
            status: GeoStatus::Success,
            lat: Some(1.0),
            lon: None,
            ..Default::default()
        });
        assert!(MapPoint::from_record(record, 10).is_none());
    }
}
