//! GATT layout of the companion service

use usmessage_core::transport::Endpoint;
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Service and Characteristic UUIDs
// ----------------------------------------------------------------------------

/// Companion service advertised by the phone app
pub const USMESSAGE_SERVICE_UUID: Uuid = Uuid::from_u128(0x12345678_1234_5678_1234_56789ABCDEF0);

/// Conversation and message request/response characteristic
pub const MESSAGES_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x12345678_1234_5678_1234_56789ABCDEF1);

/// Attachment characteristic; answers arrive as chunked notifications
pub const ATTACHMENTS_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x12345678_1234_5678_1234_56789ABCDEF2);

/// Device push characteristic
pub const NOTIFICATIONS_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x12345678_1234_5678_1234_56789ABCDEF3);

// ----------------------------------------------------------------------------
// Endpoint Mapping
// ----------------------------------------------------------------------------

/// Characteristic UUID behind each logical endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct GattLayout {
    pub service: Uuid,
    pub messages: Uuid,
    pub attachments: Uuid,
    pub notifications: Uuid,
}

impl Default for GattLayout {
    fn default() -> Self {
        Self {
            service: USMESSAGE_SERVICE_UUID,
            messages: MESSAGES_CHARACTERISTIC_UUID,
            attachments: ATTACHMENTS_CHARACTERISTIC_UUID,
            notifications: NOTIFICATIONS_CHARACTERISTIC_UUID,
        }
    }
}

impl GattLayout {
    pub fn characteristic(&self, endpoint: Endpoint) -> Uuid {
        match endpoint {
            Endpoint::Messages => self.messages,
            Endpoint::Attachments => self.attachments,
            Endpoint::Notifications => self.notifications,
        }
    }

    /// Endpoint served by characteristic `uuid`, if any
    pub fn endpoint(&self, uuid: &Uuid) -> Option<Endpoint> {
        Endpoint::ALL
            .into_iter()
            .find(|endpoint| &self.characteristic(*endpoint) == uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoints_map_to_distinct_characteristics() {
        let layout = GattLayout::default();
        for endpoint in Endpoint::ALL {
            let uuid = layout.characteristic(endpoint);
            assert_ne!(uuid, layout.service);
            assert_eq!(layout.endpoint(&uuid), Some(endpoint));
        }
        assert_eq!(layout.endpoint(&layout.service), None);
    }

    #[test]
    fn test_uuid_text_form() {
        assert_eq!(
            USMESSAGE_SERVICE_UUID.to_string(),
            "12345678-1234-5678-1234-56789abcdef0"
        );
        assert_eq!(
            NOTIFICATIONS_CHARACTERISTIC_UUID.to_string(),
            "12345678-1234-5678-1234-56789abcdef3"
        );
    }
}
