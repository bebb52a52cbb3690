//! Simulated Android device identities.
//!
//! A [`DeviceFingerprint`] is held for the length of one scrape job and
//! rendered into request headers. [`DeviceFingerprint::rotate`] draws a new
//! device so consecutive jobs against the same source look like different
//! handsets.

use rand::seq::SliceRandom;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceProfile {
    pub model: &'static str,
    pub brand: &'static str,
    pub os_version: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenProfile {
    pub width: u32,
    pub height: u32,
    pub dpi: u32,
}

/// Handsets common in the target market.
pub const DEVICE_PROFILES: &[DeviceProfile] = &[
    DeviceProfile { model: "Samsung SM-A525F", brand: "samsung", os_version: "13" },
    DeviceProfile { model: "Samsung SM-A536B", brand: "samsung", os_version: "14" },
    DeviceProfile { model: "Samsung SM-A546B", brand: "samsung", os_version: "14" },
    DeviceProfile { model: "Xiaomi Redmi Note 12", brand: "Xiaomi", os_version: "13" },
    DeviceProfile { model: "Xiaomi Redmi Note 11", brand: "Xiaomi", os_version: "12" },
    DeviceProfile { model: "Xiaomi Redmi 12", brand: "Xiaomi", os_version: "13" },
    DeviceProfile { model: "OPPO A96", brand: "OPPO", os_version: "12" },
    DeviceProfile { model: "OPPO A78", brand: "OPPO", os_version: "13" },
    DeviceProfile { model: "realme 9 Pro", brand: "realme", os_version: "13" },
    DeviceProfile { model: "realme 10", brand: "realme", os_version: "13" },
    DeviceProfile { model: "Huawei nova 9", brand: "HUAWEI", os_version: "11" },
    DeviceProfile { model: "Infinix Note 12", brand: "Infinix", os_version: "12" },
    DeviceProfile { model: "Infinix Hot 30", brand: "Infinix", os_version: "13" },
    DeviceProfile { model: "TECNO Spark 10", brand: "TECNO", os_version: "13" },
];

pub const SCREEN_PROFILES: &[ScreenProfile] = &[
    ScreenProfile { width: 1080, height: 2400, dpi: 420 },
    ScreenProfile { width: 1080, height: 2340, dpi: 400 },
    ScreenProfile { width: 720, height: 1600, dpi: 320 },
    ScreenProfile { width: 1080, height: 2408, dpi: 440 },
    ScreenProfile { width: 1080, height: 2460, dpi: 450 },
];

const PLATFORM: &str = "android";
const HTTP_STACK: &str = "okhttp/4.11.0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFingerprint {
    app_name: String,
    app_version: String,
    device_id: String,
    device: DeviceProfile,
    screen: ScreenProfile,
}

impl DeviceFingerprint {
    pub fn generate(app_name: &str, app_version: &str) -> Self {
        let mut rng = rand::thread_rng();
        Self {
            app_name: app_name.to_string(),
            app_version: app_version.to_string(),
            device_id: new_device_id(),
            device: *DEVICE_PROFILES.choose(&mut rng).unwrap_or(&DEVICE_PROFILES[0]),
            screen: *SCREEN_PROFILES.choose(&mut rng).unwrap_or(&SCREEN_PROFILES[0]),
        }
    }

    /// Draw a new device id, handset, and screen. App identity is kept.
    pub fn rotate(&mut self) {
        *self = Self::generate(&self.app_name, &self.app_version);
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn device(&self) -> &DeviceProfile {
        &self.device
    }

    pub fn app_version(&self) -> &str {
        &self.app_version
    }

    pub fn user_agent(&self) -> String {
        format!(
            "{}/{} (Linux; Android {}; {}) {}",
            self.app_name, self.app_version, self.device.os_version, self.device.model, HTTP_STACK
        )
    }

    pub fn headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("User-Agent", self.user_agent()),
            ("Accept", "application/json".to_string()),
            ("Accept-Language", "ar-EG,ar;q=0.9,en;q=0.8".to_string()),
            ("X-Device-Id", self.device_id.clone()),
            ("X-Device-Model", self.device.model.to_string()),
            ("X-Device-Brand", self.device.brand.to_string()),
            ("X-Android-Version", self.device.os_version.to_string()),
            ("X-Screen-Density", self.screen.dpi.to_string()),
            (
                "X-Screen-Resolution",
                format!("{}x{}", self.screen.width, self.screen.height),
            ),
            ("X-App-Version", self.app_version.clone()),
            ("X-Platform", PLATFORM.to_string()),
        ]
    }
}

/// 16 hex chars derived from a random UUID, shaped like an Android id.
fn new_device_id() -> String {
    let digest = Sha256::digest(uuid::Uuid::new_v4().as_bytes());
    hex::encode(&digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_shape() {
        let fp = DeviceFingerprint::generate("Alpha", "2.3.1");
        assert_eq!(fp.device_id().len(), 16);
        assert!(fp.device_id().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_user_agent_format() {
        let fp = DeviceFingerprint::generate("Alpha", "2.3.1");
        let ua = fp.user_agent();
        assert!(ua.starts_with("Alpha/2.3.1 (Linux; Android "));
        assert!(ua.contains(fp.device().model));
        assert!(ua.ends_with("okhttp/4.11.0"));
    }

    #[test]
    fn test_headers_carry_identity() {
        let fp = DeviceFingerprint::generate("Alpha", "2.3.1");
        let headers = fp.headers();
        let get = |name: &str| {
            headers
                .iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| v.clone())
                .unwrap()
        };
        assert_eq!(get("X-Device-Id"), fp.device_id());
        assert_eq!(get("X-App-Version"), "2.3.1");
        assert_eq!(get("X-Platform"), "android");
    }

    #[test]
    fn test_rotate_changes_device_keeps_app() {
        let mut fp = DeviceFingerprint::generate("Alpha", "2.3.1");
        let before = fp.device_id().to_string();
        fp.rotate();
        assert_ne!(fp.device_id(), before);
        assert_eq!(fp.app_version(), "2.3.1");
        assert!(fp.user_agent().starts_with("Alpha/2.3.1"));
    }
}
