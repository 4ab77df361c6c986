//! Standard OCPP 2.0.1 actions
//!
//! The payload definitions come from `rust_ocpp`; this module only
//! pairs each request with its action string, response type and the
//! defaults a router needs when it must answer on a station's or
//! CSMS's behalf. The catalog is deliberately small - any action a
//! deployment routes can be registered the same way.

use chrono::Utc;
use rust_ocpp::v2_0_1::enumerations::data_transfer_status_enum_type::DataTransferStatusEnumType;
use rust_ocpp::v2_0_1::enumerations::registration_status_enum_type::RegistrationStatusEnumType;
use rust_ocpp::v2_0_1::enumerations::reserve_now_status_enum_type::ReserveNowStatusEnumType;
use rust_ocpp::v2_0_1::enumerations::reset_status_enum_type::ResetStatusEnumType;
use rust_ocpp::v2_0_1::messages::boot_notification::{
    BootNotificationRequest, BootNotificationResponse,
};
use rust_ocpp::v2_0_1::messages::datatransfer::{DataTransferRequest, DataTransferResponse};
use rust_ocpp::v2_0_1::messages::heartbeat::{HeartbeatRequest, HeartbeatResponse};
use rust_ocpp::v2_0_1::messages::meter_values::{MeterValuesRequest, MeterValuesResponse};
use rust_ocpp::v2_0_1::messages::reserve_now::{ReserveNowRequest, ReserveNowResponse};
use rust_ocpp::v2_0_1::messages::reset::{ResetRequest, ResetResponse};
use rust_ocpp::v2_0_1::messages::status_notification::{
    StatusNotificationRequest, StatusNotificationResponse,
};

use crate::routing::codec::{OcppRequest, OcppResponse};

impl OcppRequest for HeartbeatRequest {
    const ACTION: &'static str = "Heartbeat";
    type Response = HeartbeatResponse;

    // A heartbeat can always be answered, handler or not.
    fn failed_response(&self) -> Option<HeartbeatResponse> {
        Some(HeartbeatResponse {
            current_time: Utc::now(),
        })
    }
}
impl OcppResponse for HeartbeatResponse {}

impl OcppRequest for BootNotificationRequest {
    const ACTION: &'static str = "BootNotification";
    type Response = BootNotificationResponse;

    fn failed_response(&self) -> Option<BootNotificationResponse> {
        // 300s retry interval, same default the upstream would hand out
        Some(BootNotificationResponse {
            current_time: Utc::now(),
            interval: 300,
            status: RegistrationStatusEnumType::Rejected,
            status_info: None,
        })
    }
}
impl OcppResponse for BootNotificationResponse {}

impl OcppRequest for StatusNotificationRequest {
    const ACTION: &'static str = "StatusNotification";
    type Response = StatusNotificationResponse;

    fn failed_response(&self) -> Option<StatusNotificationResponse> {
        Some(StatusNotificationResponse {})
    }
}
impl OcppResponse for StatusNotificationResponse {}

impl OcppRequest for MeterValuesRequest {
    const ACTION: &'static str = "MeterValues";
    type Response = MeterValuesResponse;

    fn failed_response(&self) -> Option<MeterValuesResponse> {
        Some(MeterValuesResponse {})
    }
}
impl OcppResponse for MeterValuesResponse {}

impl OcppRequest for DataTransferRequest {
    const ACTION: &'static str = "DataTransfer";
    type Response = DataTransferResponse;

    fn failed_response(&self) -> Option<DataTransferResponse> {
        Some(DataTransferResponse {
            status: DataTransferStatusEnumType::Rejected,
            data: None,
            status_info: None,
        })
    }
}
impl OcppResponse for DataTransferResponse {}

impl OcppRequest for ResetRequest {
    const ACTION: &'static str = "Reset";
    type Response = ResetResponse;

    fn failed_response(&self) -> Option<ResetResponse> {
        Some(ResetResponse {
            status: ResetStatusEnumType::Rejected,
            status_info: None,
        })
    }
}
impl OcppResponse for ResetResponse {}

impl OcppRequest for ReserveNowRequest {
    const ACTION: &'static str = "ReserveNow";
    type Response = ReserveNowResponse;

    fn failed_response(&self) -> Option<ReserveNowResponse> {
        Some(ReserveNowResponse {
            status: ReserveNowStatusEnumType::Rejected,
            status_info: None,
        })
    }
}
impl OcppResponse for ReserveNowResponse {}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_ocpp::v2_0_1::enumerations::reset_enum_type::ResetEnumType;

    #[test]
    fn action_strings_match_the_wire() {
        assert_eq!(HeartbeatRequest::ACTION, "Heartbeat");
        assert_eq!(ResetRequest::ACTION, "Reset");
        assert_eq!(ReserveNowRequest::ACTION, "ReserveNow");
    }

    #[test]
    fn reset_serializes_with_wire_field_names() {
        let request = ResetRequest {
            request_type: ResetEnumType::Immediate,
            evse_id: None,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["type"], "Immediate");
    }

    #[test]
    fn unanswered_reset_defaults_to_rejected() {
        let request = ResetRequest {
            request_type: ResetEnumType::OnIdle,
            evse_id: None,
        };
        let response = request.failed_response().unwrap();
        assert!(matches!(response.status, ResetStatusEnumType::Rejected));
    }

    #[test]
    fn heartbeat_always_has_an_answer() {
        let response = HeartbeatRequest {}.failed_response();
        assert!(response.is_some());
    }
}
