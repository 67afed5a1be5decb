//! Handlers for charger-initiated calls

use crate::{
    manager::ChargePointManager,
    persistence::StationAttributes,
    session::{BootInfo, ConnectorStatus},
    transaction::StopRequest,
    CsmsError, CsmsResult,
};
use chrono::Utc;
use ocpp_messages::{v16j::*, CallMessage, Message, OcppRequest, Validate};
use ocpp_types::v16j::{DataTransferStatus, RegistrationStatus};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

impl ChargePointManager {
    /// Answer one Call. Never fails: errors become CallErrors.
    pub(crate) async fn handle_call(
        &self,
        charger_id: &str,
        connection_id: Uuid,
        call: &CallMessage,
    ) -> Message {
        let result = if call.action != BootNotificationRequest::ACTION
            && !self.sessions.is_operational(charger_id, connection_id)
        {
            Err(CsmsError::protocol_violation(format!(
                "{} received before BootNotification: not yet registered",
                call.action
            )))
        } else {
            self.dispatch(charger_id, connection_id, call).await
        };

        result.unwrap_or_else(|error| {
            warn!(
                charger_id,
                action = %call.action,
                unique_id = %call.unique_id,
                error = %error,
                "Rejecting call"
            );
            error.to_call_error(call.unique_id.clone())
        })
    }

    async fn dispatch(
        &self,
        charger_id: &str,
        connection_id: Uuid,
        call: &CallMessage,
    ) -> CsmsResult<Message> {
        match call.action.as_str() {
            BootNotificationRequest::ACTION => {
                let response = self.boot_notification(charger_id, connection_id, parse(call)?)?;
                reply(call, response)
            }
            HeartbeatRequest::ACTION => {
                let _: HeartbeatRequest = parse_unchecked(call)?;
                reply(call, self.heartbeat(charger_id, connection_id))
            }
            StatusNotificationRequest::ACTION => {
                self.status_notification(charger_id, connection_id, parse(call)?);
                reply(call, StatusNotificationResponse::default())
            }
            AuthorizeRequest::ACTION => {
                let request: AuthorizeRequest = parse(call)?;
                let id_tag_info = self.authorizer.authorize(&request.id_tag).await;
                reply(call, AuthorizeResponse { id_tag_info })
            }
            StartTransactionRequest::ACTION => {
                let response = self.start_transaction(charger_id, parse(call)?).await?;
                reply(call, response)
            }
            StopTransactionRequest::ACTION => {
                let response = self.stop_transaction(charger_id, parse(call)?).await?;
                reply(call, response)
            }
            MeterValuesRequest::ACTION => {
                self.meter_values(charger_id, parse(call)?);
                reply(call, MeterValuesResponse::default())
            }
            DataTransferRequest::ACTION => {
                let request: DataTransferRequest = parse(call)?;
                debug!(charger_id, vendor_id = %request.vendor_id, message_id = ?request.message_id, "DataTransfer");
                reply(
                    call,
                    DataTransferResponse {
                        status: DataTransferStatus::UnknownVendorId,
                        data: None,
                    },
                )
            }
            DiagnosticsStatusNotificationRequest::ACTION => {
                let request: DiagnosticsStatusNotificationRequest = parse_unchecked(call)?;
                self.sessions
                    .set_diagnostics_status(charger_id, connection_id, request.status);
                reply(call, DiagnosticsStatusNotificationResponse::default())
            }
            FirmwareStatusNotificationRequest::ACTION => {
                let request: FirmwareStatusNotificationRequest = parse_unchecked(call)?;
                self.sessions
                    .set_firmware_status(charger_id, connection_id, request.status);
                reply(call, FirmwareStatusNotificationResponse::default())
            }
            _ => Err(CsmsError::NotImplemented {
                action: call.action.clone(),
            }),
        }
    }

    fn boot_notification(
        &self,
        charger_id: &str,
        connection_id: Uuid,
        request: BootNotificationRequest,
    ) -> CsmsResult<BootNotificationResponse> {
        let now = Utc::now();
        let serial_number = request
            .charge_point_serial_number
            .clone()
            .or_else(|| request.charge_box_serial_number.clone());

        let accepted = self.sessions.accept_boot(
            charger_id,
            connection_id,
            BootInfo {
                vendor: request.charge_point_vendor.clone(),
                model: request.charge_point_model.clone(),
                serial_number: serial_number.clone(),
                firmware_version: request.firmware_version.clone(),
                booted_at: now,
            },
        );
        if !accepted {
            return Err(CsmsError::protocol_violation(
                "BootNotification on a connection that no longer holds the identity",
            ));
        }
        self.registry
            .set_heartbeat_interval(charger_id, self.config.heartbeat_period());
        self.outbox.persistence().upsert_station(StationAttributes {
            vendor: Some(request.charge_point_vendor),
            model: Some(request.charge_point_model),
            serial_number,
            firmware_version: request.firmware_version,
            online: Some(true),
            ..StationAttributes::new(charger_id)
        });

        info!(charger_id, interval = self.config.heartbeat_interval, "Charger registered");
        Ok(BootNotificationResponse {
            current_time: now,
            interval: self.config.heartbeat_interval as i32,
            status: RegistrationStatus::Accepted,
        })
    }

    fn heartbeat(&self, charger_id: &str, connection_id: Uuid) -> HeartbeatResponse {
        let now = Utc::now();
        self.sessions.record_heartbeat(charger_id, connection_id, now);
        self.outbox.persistence().upsert_station(StationAttributes {
            last_heartbeat: Some(now),
            ..StationAttributes::new(charger_id)
        });
        HeartbeatResponse { current_time: now }
    }

    fn status_notification(
        &self,
        charger_id: &str,
        connection_id: Uuid,
        request: StatusNotificationRequest,
    ) {
        debug!(
            charger_id,
            connector_id = request.connector_id,
            status = %request.status,
            "StatusNotification"
        );
        self.sessions.apply_status(
            charger_id,
            connection_id,
            request.connector_id,
            ConnectorStatus {
                status: request.status,
                error_code: request.error_code,
                info: request.info,
                updated_at: request.timestamp.unwrap_or_else(Utc::now),
            },
        );
    }

    async fn start_transaction(
        &self,
        charger_id: &str,
        request: StartTransactionRequest,
    ) -> CsmsResult<StartTransactionResponse> {
        let transaction_id = self.ledger.open(
            charger_id,
            request.connector_id,
            &request.id_tag,
            request.meter_start,
            request.timestamp,
        )?;
        let id_tag_info = self.authorizer.authorize(&request.id_tag).await;
        let transaction = self.ledger.activate(transaction_id)?;
        self.outbox
            .persistence()
            .create_transaction(transaction.to_record());

        info!(
            charger_id,
            transaction_id,
            connector_id = request.connector_id,
            authorization = ?id_tag_info.status,
            "Transaction started"
        );
        Ok(StartTransactionResponse {
            id_tag_info,
            transaction_id,
        })
    }

    async fn stop_transaction(
        &self,
        charger_id: &str,
        request: StopTransactionRequest,
    ) -> CsmsResult<StopTransactionResponse> {
        let transaction = self.ledger.stop(
            charger_id,
            StopRequest {
                transaction_id: request.transaction_id,
                meter_stop: request.meter_stop,
                timestamp: request.timestamp,
                reason: request.reason,
            },
        )?;
        self.outbox
            .persistence()
            .complete_transaction(transaction.to_record());

        info!(
            charger_id,
            transaction_id = transaction.transaction_id,
            energy_wh = request.meter_stop - transaction.meter_start,
            "Transaction stopped"
        );

        let id_tag_info = match &request.id_tag {
            Some(id_tag) => Some(self.authorizer.authorize(id_tag).await),
            None => None,
        };
        Ok(StopTransactionResponse { id_tag_info })
    }

    fn meter_values(&self, charger_id: &str, request: MeterValuesRequest) {
        let Some(transaction_id) = request.transaction_id else {
            return;
        };
        let latest = request
            .meter_value
            .iter()
            .filter_map(|value| value.energy_import_wh().map(|wh| (value.timestamp, wh)))
            .max_by_key(|(timestamp, _)| *timestamp);

        if let Some((_, wh)) = latest {
            if !self.ledger.record_meter_sample(charger_id, transaction_id, wh) {
                debug!(charger_id, transaction_id, "Meter values for a transaction that is not active");
            }
        }
    }
}

/// Deserialize and check field constraints
fn parse<T>(call: &CallMessage) -> CsmsResult<T>
where
    T: DeserializeOwned + Validate,
{
    let request: T = parse_unchecked(call)?;
    request.validate()?;
    Ok(request)
}

fn parse_unchecked<T: DeserializeOwned>(call: &CallMessage) -> CsmsResult<T> {
    call.payload_as().map_err(|e| CsmsError::InvalidPayload {
        action: call.action.clone(),
        message: e.to_string(),
    })
}

fn reply<T: Serialize>(call: &CallMessage, response: T) -> CsmsResult<Message> {
    Ok(Message::call_result(call.unique_id.clone(), response)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        auth::AllowAll,
        config::{MetricsConfig, OcppConfig},
        metrics::MetricsRegistry,
        persistence::{spawn_writer, MemoryPersistence},
    };
    use ocpp_transport::ConnectionHandle;
    use ocpp_types::CallErrorCode;
    use serde_json::{json, Value};
    use std::sync::Arc;

    fn booted() -> (ChargePointManager, Uuid) {
        let (persistence, _task) = spawn_writer(Arc::new(MemoryPersistence::new()));
        let manager = ChargePointManager::new(
            &OcppConfig::default(),
            persistence,
            Arc::new(MetricsRegistry::new(&MetricsConfig::default()).unwrap()),
            Arc::new(AllowAll),
        );
        let (handle, _rx) = ConnectionHandle::channel();
        let connection_id = handle.id();
        manager.connect("CP001", handle, None);
        manager.connection_ready("CP001", connection_id);
        (manager, connection_id)
    }

    async fn call(manager: &ChargePointManager, conn: Uuid, action: &str, payload: Value) -> Message {
        let call = CallMessage::with_id("u1", action, payload).unwrap();
        manager.handle_call("CP001", conn, &call).await
    }

    fn error_code(message: &Message) -> CallErrorCode {
        match message {
            Message::CallError(err) => err.error_code,
            other => panic!("expected CallError, got {:?}", other),
        }
    }

    fn payload(message: Message) -> Value {
        match message {
            Message::CallResult(result) => result.payload,
            other => panic!("expected CallResult, got {:?}", other),
        }
    }

    async fn boot(manager: &ChargePointManager, conn: Uuid) {
        let response = call(
            manager,
            conn,
            "BootNotification",
            json!({"chargePointVendor": "VendorX", "chargePointModel": "ModelY"}),
        )
        .await;
        assert_eq!(payload(response)["status"], "Accepted");
    }

    #[tokio::test]
    async fn test_calls_before_boot_rejected() {
        let (manager, conn) = booted();
        let response = call(&manager, conn, "Heartbeat", json!({})).await;
        assert_eq!(error_code(&response), CallErrorCode::SecurityError);
        assert!(!manager.sessions().is_operational("CP001", conn));

        boot(&manager, conn).await;
        assert!(manager.sessions().is_operational("CP001", conn));
        let response = call(&manager, conn, "Heartbeat", json!({})).await;
        assert!(payload(response)["currentTime"].is_string());
    }

    #[tokio::test]
    async fn test_boot_reply_carries_interval() {
        let (manager, conn) = booted();
        let response = call(
            &manager,
            conn,
            "BootNotification",
            json!({"chargePointVendor": "VendorX", "chargePointModel": "ModelY"}),
        )
        .await;
        let body = payload(response);
        assert_eq!(body["interval"], 300);
        assert_eq!(body["status"], "Accepted");
    }

    #[tokio::test]
    async fn test_payload_errors() {
        let (manager, conn) = booted();
        boot(&manager, conn).await;

        let response = call(&manager, conn, "StartTransaction", json!({"connectorId": "one"})).await;
        assert_eq!(error_code(&response), CallErrorCode::FormationViolation);

        let response = call(
            &manager,
            conn,
            "Authorize",
            json!({"idTag": "THIS_ID_TAG_IS_FAR_TOO_LONG"}),
        )
        .await;
        assert_eq!(error_code(&response), CallErrorCode::PropertyConstraintViolation);

        let response = call(&manager, conn, "SignCertificate", json!({})).await;
        assert_eq!(error_code(&response), CallErrorCode::NotImplemented);
    }

    #[tokio::test]
    async fn test_meter_values_recorded_on_active_transaction() {
        let (manager, conn) = booted();
        boot(&manager, conn).await;

        let started = payload(
            call(
                &manager,
                conn,
                "StartTransaction",
                json!({"connectorId": 1, "idTag": "USER_123", "meterStart": 0, "timestamp": "2024-01-01T10:00:00Z"}),
            )
            .await,
        );
        let transaction_id = started["transactionId"].as_i64().unwrap() as i32;

        let response = call(
            &manager,
            conn,
            "MeterValues",
            json!({
                "connectorId": 1,
                "transactionId": transaction_id,
                "meterValue": [{
                    "timestamp": "2024-01-01T10:05:00Z",
                    "sampledValue": [{"value": "1.5", "unit": "kWh"}]
                }]
            }),
        )
        .await;
        assert_eq!(payload(response), json!({}));
        assert_eq!(manager.ledger().get(transaction_id).unwrap().last_meter_wh, Some(1500.0));
    }

    #[tokio::test]
    async fn test_status_and_firmware_kept_on_session() {
        let (manager, conn) = booted();
        boot(&manager, conn).await;

        call(
            &manager,
            conn,
            "StatusNotification",
            json!({"connectorId": 1, "errorCode": "NoError", "status": "Charging"}),
        )
        .await;
        call(&manager, conn, "FirmwareStatusNotification", json!({"status": "Installing"})).await;
        let response = call(&manager, conn, "DataTransfer", json!({"vendorId": "Acme"})).await;
        assert_eq!(payload(response)["status"], "UnknownVendorId");

        let session = manager.sessions().get("CP001").unwrap();
        assert_eq!(
            session.connectors[&1].status,
            ocpp_types::v16j::ChargePointStatus::Charging
        );
        assert_eq!(
            session.firmware_status,
            Some(ocpp_types::v16j::FirmwareStatus::Installing)
        );
    }
}
