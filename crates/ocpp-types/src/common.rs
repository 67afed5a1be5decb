//! Data types shared by several OCPP 1.6 payloads

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Measurand reported when none is given in a sampled value
pub const DEFAULT_MEASURAND: &str = "Energy.Active.Import.Register";

/// Meter value with timestamp
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeterValue {
    /// Timestamp of the meter value
    pub timestamp: DateTime<Utc>,
    /// Sampled values
    #[serde(rename = "sampledValue")]
    pub sampled_value: Vec<SampledValue>,
}

impl MeterValue {
    /// Active energy import register in Wh, if this sample carries one
    pub fn energy_import_wh(&self) -> Option<f64> {
        self.sampled_value
            .iter()
            .filter(|sample| sample.format.as_deref() != Some("SignedData"))
            .find(|sample| {
                sample.measurand.as_deref().unwrap_or(DEFAULT_MEASURAND) == DEFAULT_MEASURAND
            })
            .and_then(|sample| {
                let value: f64 = sample.value.trim().parse().ok()?;
                match sample.unit.as_deref() {
                    Some("kWh") => Some(value * 1000.0),
                    None | Some("Wh") => Some(value),
                    Some(_) => None,
                }
            })
    }
}

/// Single sampled value.
///
/// Enumerated attributes are kept as strings: chargers in the field send
/// vendor spellings and the central system only interprets a few of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampledValue {
    /// Value as string
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub measurand: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

/// Id tag info containing authorization data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdTagInfo {
    /// Authorization status
    pub status: AuthorizationStatus,
    /// Parent id tag (optional)
    #[serde(rename = "parentIdTag", skip_serializing_if = "Option::is_none")]
    pub parent_id_tag: Option<String>,
    /// Expiry date (optional)
    #[serde(rename = "expiryDate", skip_serializing_if = "Option::is_none")]
    pub expiry_date: Option<DateTime<Utc>>,
}

impl IdTagInfo {
    pub fn with_status(status: AuthorizationStatus) -> Self {
        Self {
            status,
            parent_id_tag: None,
            expiry_date: None,
        }
    }
}

/// Authorization status for id tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum AuthorizationStatus {
    /// Identifier is allowed for charging
    Accepted,
    /// Identifier has been blocked
    Blocked,
    /// Identifier has expired
    Expired,
    /// Identifier is invalid
    Invalid,
    /// Identifier is already involved in another transaction
    ConcurrentTx,
}

impl AuthorizationStatus {
    pub fn is_accepted(&self) -> bool {
        matches!(self, AuthorizationStatus::Accepted)
    }
}

/// Reason for stopping a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum Reason {
    EmergencyStop,
    EVDisconnected,
    HardReset,
    Local,
    Other,
    PowerLoss,
    Reboot,
    Remote,
    SoftReset,
    UnlockCommand,
    DeAuthorized,
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Reason::EmergencyStop => "EmergencyStop",
            Reason::EVDisconnected => "EVDisconnected",
            Reason::HardReset => "HardReset",
            Reason::Local => "Local",
            Reason::Other => "Other",
            Reason::PowerLoss => "PowerLoss",
            Reason::Reboot => "Reboot",
            Reason::Remote => "Remote",
            Reason::SoftReset => "SoftReset",
            Reason::UnlockCommand => "UnlockCommand",
            Reason::DeAuthorized => "DeAuthorized",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn sample(value: &str, measurand: Option<&str>, unit: Option<&str>) -> SampledValue {
        SampledValue {
            value: value.to_string(),
            context: None,
            format: None,
            measurand: measurand.map(str::to_string),
            phase: None,
            location: None,
            unit: unit.map(str::to_string),
        }
    }

    #[test]
    fn test_id_tag_info_omits_empty_fields() {
        let info = IdTagInfo::with_status(AuthorizationStatus::Accepted);
        assert_eq!(serde_json::to_value(&info).unwrap(), json!({"status": "Accepted"}));
    }

    #[test]
    fn test_energy_import_normalised_to_wh() {
        let meter = MeterValue {
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
            sampled_value: vec![
                sample("230.1", Some("Voltage"), Some("V")),
                sample("1.5", Some("Energy.Active.Import.Register"), Some("kWh")),
            ],
        };
        assert_eq!(meter.energy_import_wh(), Some(1500.0));
    }

    #[test]
    fn test_energy_import_defaults_measurand() {
        let meter = MeterValue {
            timestamp: Utc::now(),
            sampled_value: vec![sample("420", None, None)],
        };
        assert_eq!(meter.energy_import_wh(), Some(420.0));

        let no_energy = MeterValue {
            timestamp: Utc::now(),
            sampled_value: vec![sample("16", Some("Current.Import"), Some("A"))],
        };
        assert_eq!(no_energy.energy_import_wh(), None);
    }

    #[test]
    fn test_meter_value_wire_names() {
        let meter: MeterValue = serde_json::from_value(json!({
            "timestamp": "2024-01-01T00:00:00Z",
            "sampledValue": [{"value": "10", "measurand": "Energy.Active.Import.Register", "unit": "Wh"}]
        }))
        .unwrap();
        assert_eq!(meter.sampled_value.len(), 1);
        assert_eq!(meter.energy_import_wh(), Some(10.0));
    }

    #[test]
    fn test_reason_display_matches_wire() {
        assert_eq!(Reason::EVDisconnected.to_string(), "EVDisconnected");
        assert_eq!(serde_json::to_value(Reason::Remote).unwrap(), json!("Remote"));
    }
}
