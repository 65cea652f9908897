//! Thin wrapper around [lifx_protocol::get_product_info] that fails loudly on unknown ids and
//! derives the emulator's [Capabilities] set from a [lifx_protocol::ProductInfo].

use lifx_protocol::{get_product_info, ProductInfo};
use thiserror::Error;

use crate::capability::Capabilities;

#[derive(Debug, Error)]
#[error("unknown product: vendor {vendor}, product {product}")]
pub struct UnknownProduct {
    pub vendor: u32,
    pub product: u32,
}

/// Look up product metadata, failing with [UnknownProduct] instead of returning `None`.
///
/// Device construction needs a hard failure here: an emulator device with no known capability
/// set can't be safely dispatched to.
pub fn lookup(vendor: u32, product: u32) -> Result<&'static ProductInfo, UnknownProduct> {
    get_product_info(vendor, product).ok_or(UnknownProduct { vendor, product })
}

/// First-generation LIFX Z; the only multizone product id that predates the extended
/// (512-zone, `StateExtendedColorZones`) firmware.
const NO_EXTENDED_MULTIZONE_PRODUCT: u32 = 31;

/// Derive the boolean capability set a device gets at construction time.
pub fn capabilities_for(info: &ProductInfo, product: u32) -> Capabilities {
    Capabilities {
        color: info.color,
        infrared: info.infrared,
        multizone: info.multizone,
        extended_multizone: info.multizone && product != NO_EXTENDED_MULTIZONE_PRODUCT,
        matrix: info.matrix,
        chain: info.chain,
        hev: info.hev,
        relays: info.relays,
        buttons: info.buttons,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_product_is_an_error() {
        assert!(lookup(1, 999_999).is_err());
    }

    #[test]
    fn original_z_lacks_extended_multizone() {
        let info = lookup(1, 31).unwrap();
        let caps = capabilities_for(info, 31);
        assert!(caps.multizone);
        assert!(!caps.extended_multizone);
    }

    #[test]
    fn later_z_has_extended_multizone() {
        let info = lookup(1, 32).unwrap();
        let caps = capabilities_for(info, 32);
        assert!(caps.multizone);
        assert!(caps.extended_multizone);
    }
}
