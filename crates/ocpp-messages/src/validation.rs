//! Field constraints of OCPP 1.6 payloads
//!
//! Deserialization already enforces types and required fields; these checks
//! cover the CiString length limits and numeric ranges serde cannot express.

use crate::v16j::*;
use ocpp_types::{OcppError, OcppResult};

/// Validation trait for OCPP payloads
pub trait Validate {
    fn validate(&self) -> OcppResult<()>;
}

/// Configuration keys whose values must be non-negative integers
const INTEGER_KEYS: &[&str] = &[
    "ClockAlignedDataInterval",
    "ConnectionTimeOut",
    "HeartbeatInterval",
    "MeterValueSampleInterval",
    "MinimumStatusDuration",
    "ResetRetries",
    "TransactionMessageAttempts",
    "TransactionMessageRetryInterval",
    "WebSocketPingInterval",
];

/// Configuration keys whose values must be `true` or `false`
const BOOLEAN_KEYS: &[&str] = &[
    "AllowOfflineTxForUnknownId",
    "AuthorizationCacheEnabled",
    "AuthorizeRemoteTxRequests",
    "LocalAuthorizeOffline",
    "LocalPreAuthorize",
    "StopTransactionOnEVSideDisconnect",
    "StopTransactionOnInvalidId",
    "UnlockConnectorOnEVSideDisconnect",
];

impl Validate for AuthorizeRequest {
    fn validate(&self) -> OcppResult<()> {
        validate_string_field("idTag", &self.id_tag, Some(1), Some(20))
    }
}

impl Validate for BootNotificationRequest {
    fn validate(&self) -> OcppResult<()> {
        validate_string_field("chargePointVendor", &self.charge_point_vendor, Some(1), Some(20))?;
        validate_string_field("chargePointModel", &self.charge_point_model, Some(1), Some(20))?;
        validate_optional_field("chargePointSerialNumber", &self.charge_point_serial_number, 25)?;
        validate_optional_field("chargeBoxSerialNumber", &self.charge_box_serial_number, 25)?;
        validate_optional_field("firmwareVersion", &self.firmware_version, 50)?;
        validate_optional_field("iccid", &self.iccid, 20)?;
        validate_optional_field("imsi", &self.imsi, 20)?;
        validate_optional_field("meterType", &self.meter_type, 25)?;
        validate_optional_field("meterSerialNumber", &self.meter_serial_number, 25)
    }
}

impl Validate for StartTransactionRequest {
    fn validate(&self) -> OcppResult<()> {
        validate_connector_id(self.connector_id, false)?;
        validate_string_field("idTag", &self.id_tag, Some(1), Some(20))?;

        if self.meter_start < 0 {
            return Err(OcppError::validation("meterStart cannot be negative"));
        }

        Ok(())
    }
}

impl Validate for StopTransactionRequest {
    fn validate(&self) -> OcppResult<()> {
        if let Some(ref id_tag) = self.id_tag {
            validate_string_field("idTag", id_tag, Some(1), Some(20))?;
        }

        if self.meter_stop < 0 {
            return Err(OcppError::validation("meterStop cannot be negative"));
        }

        Ok(())
    }
}

impl Validate for StatusNotificationRequest {
    fn validate(&self) -> OcppResult<()> {
        // connector 0 addresses the whole charge point
        validate_optional_field("info", &self.info, 50)?;
        validate_optional_field("vendorId", &self.vendor_id, 255)?;
        validate_optional_field("vendorErrorCode", &self.vendor_error_code, 50)
    }
}

impl Validate for MeterValuesRequest {
    fn validate(&self) -> OcppResult<()> {
        if self.meter_value.is_empty() {
            return Err(OcppError::validation("meterValue array cannot be empty"));
        }

        for meter_value in &self.meter_value {
            if meter_value.sampled_value.is_empty() {
                return Err(OcppError::validation(
                    "sampledValue array in meterValue cannot be empty",
                ));
            }
        }

        Ok(())
    }
}

impl Validate for DataTransferRequest {
    fn validate(&self) -> OcppResult<()> {
        validate_string_field("vendorId", &self.vendor_id, Some(1), Some(255))?;
        validate_optional_field("messageId", &self.message_id, 50)
    }
}

impl Validate for ChangeConfigurationRequest {
    fn validate(&self) -> OcppResult<()> {
        validate_string_field("key", &self.key, Some(1), Some(50))?;
        validate_string_field("value", &self.value, None, Some(500))?;
        validate_configuration_value(&self.key, &self.value)
    }
}

impl Validate for RemoteStartTransactionRequest {
    fn validate(&self) -> OcppResult<()> {
        if let Some(connector_id) = self.connector_id {
            validate_connector_id(connector_id, false)?;
        }
        validate_string_field("idTag", &self.id_tag, Some(1), Some(20))
    }
}

/// Check the value format of well-known configuration keys.
/// Vendor-specific keys are accepted as-is.
pub fn validate_configuration_value(key: &str, value: &str) -> OcppResult<()> {
    if INTEGER_KEYS.contains(&key) && value.parse::<u32>().is_err() {
        return Err(OcppError::validation(format!(
            "Value '{}' for key '{}' is not a valid non-negative integer",
            value, key
        )));
    }

    if BOOLEAN_KEYS.contains(&key) && value != "true" && value != "false" {
        return Err(OcppError::validation(format!(
            "Value '{}' for key '{}' is not a valid boolean (true/false)",
            value, key
        )));
    }

    Ok(())
}

/// Validate a string field with length constraints (in characters)
pub fn validate_string_field(
    field_name: &str,
    value: &str,
    min_length: Option<usize>,
    max_length: Option<usize>,
) -> OcppResult<()> {
    let length = value.chars().count();

    if let Some(min) = min_length {
        if length < min {
            return Err(OcppError::validation(format!(
                "{} must be at least {} characters long",
                field_name, min
            )));
        }
    }

    if let Some(max) = max_length {
        if length > max {
            return Err(OcppError::validation(format!(
                "{} cannot be longer than {} characters",
                field_name, max
            )));
        }
    }

    Ok(())
}

fn validate_optional_field(field_name: &str, value: &Option<String>, max: usize) -> OcppResult<()> {
    match value {
        Some(value) => validate_string_field(field_name, value, None, Some(max)),
        None => Ok(()),
    }
}

/// Validate a connector ID
pub fn validate_connector_id(connector_id: u32, allow_zero: bool) -> OcppResult<()> {
    if connector_id == 0 && !allow_zero {
        return Err(OcppError::validation("connectorId must be greater than 0"));
    }

    Ok(())
}
