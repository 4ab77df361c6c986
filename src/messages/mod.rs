//! Message catalog
//!
//! Pairings of action strings with `rust_ocpp` payload types, plus the
//! overlay-only binary transfer. [`register_standard_actions`] wires
//! the whole set into a registry in one call.

pub mod binary;
pub mod standard;

pub use binary::{
    BinaryDataTransferRequest, BinaryDataTransferResponse, BinaryDataTransferStatus,
};

use crate::routing::registry::MessageRegistry;

/// Register every action this crate ships definitions for.
pub fn register_standard_actions(registry: &MessageRegistry) {
    use rust_ocpp::v2_0_1::messages::boot_notification::BootNotificationRequest;
    use rust_ocpp::v2_0_1::messages::datatransfer::DataTransferRequest;
    use rust_ocpp::v2_0_1::messages::heartbeat::HeartbeatRequest;
    use rust_ocpp::v2_0_1::messages::meter_values::MeterValuesRequest;
    use rust_ocpp::v2_0_1::messages::reserve_now::ReserveNowRequest;
    use rust_ocpp::v2_0_1::messages::reset::ResetRequest;
    use rust_ocpp::v2_0_1::messages::status_notification::StatusNotificationRequest;

    registry.register::<HeartbeatRequest>();
    registry.register::<BootNotificationRequest>();
    registry.register::<StatusNotificationRequest>();
    registry.register::<MeterValuesRequest>();
    registry.register::<DataTransferRequest>();
    registry.register::<ResetRequest>();
    registry.register::<ReserveNowRequest>();
    registry.register_binary::<BinaryDataTransferRequest>();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_catalog_registers_in_one_call() {
        let registry = MessageRegistry::new();
        register_standard_actions(&registry);

        assert!(registry.is_registered("Heartbeat"));
        assert!(registry.is_registered("Reset"));
        assert!(registry.is_registered("ReserveNow"));
        assert!(registry.is_registered("BinaryDataTransfer"));
        assert!(!registry.is_registered("ClearCache"));
    }
}
