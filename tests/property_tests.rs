//! Property-based tests for mycel
//!
//! Uses proptest to verify invariants across large input spaces.

use proptest::prelude::*;

// ============================================================================
// Address Derivation Properties
// ============================================================================

mod address_properties {
    use super::*;
    use mycel_crypto::address::{ADDRESS_PREFIX, in_overlay_range};
    use mycel_crypto::{Address, PublicKey, Subnet};

    proptest! {
        /// Every derived address and subnet lies inside the overlay range
        #[test]
        fn derived_addresses_are_in_range(bytes in any::<[u8; 32]>()) {
            let key = PublicKey::from_bytes(bytes);
            let addr = Address::for_key(&key);
            let subnet = Subnet::for_key(&key);

            prop_assert_eq!(addr.0[0], ADDRESS_PREFIX);
            prop_assert!(addr.is_valid());
            prop_assert!(subnet.is_valid());
            prop_assert!(!Address(subnet.to_ipv6().octets()).is_valid());
            prop_assert!(in_overlay_range(&addr.to_ipv6()));
            prop_assert!(in_overlay_range(&subnet.to_ipv6()));
        }

        /// The subnet shares the address's leading-ones count and bits
        #[test]
        fn subnet_mirrors_address(bytes in any::<[u8; 32]>()) {
            let key = PublicKey::from_bytes(bytes);
            let addr = Address::for_key(&key);
            let subnet = Subnet::for_key(&key);

            prop_assert_eq!(subnet.0[1], addr.0[1]);
            prop_assert_eq!(&subnet.0[2..], &addr.0[2..8]);
        }

        /// The partial key recovered from an address maps back to it
        #[test]
        fn partial_key_maps_back(bytes in any::<[u8; 32]>()) {
            let key = PublicKey::from_bytes(bytes);
            let addr = Address::for_key(&key);
            let subnet = Subnet::for_key(&key);

            prop_assert_eq!(Subnet::for_key(&addr.partial_key()), subnet);
            prop_assert_eq!(Subnet::for_key(&subnet.partial_key()), subnet);
        }
    }
}

// ============================================================================
// Metadata Properties
// ============================================================================

mod metadata_properties {
    use super::*;
    use mycel_core::VersionMetadata;
    use mycel_crypto::PublicKey;

    proptest! {
        /// Metadata built from any key and priority passes its own check
        #[test]
        fn base_metadata_is_compatible(bytes in any::<[u8; 32]>(), priority in any::<u8>()) {
            let key = PublicKey::from_bytes(bytes);
            let meta = VersionMetadata::base(&key, priority);
            let decoded = VersionMetadata::decode(&meta.encode()).unwrap();

            prop_assert!(decoded.check());
            prop_assert_eq!(decoded.key(), Some(key));
            prop_assert_eq!(decoded.priority, priority);
        }

        /// Any strict prefix of an encoding is rejected
        #[test]
        fn truncated_metadata_is_rejected(bytes in any::<[u8; 32]>(), cut in 0usize..40) {
            let encoded = VersionMetadata::base(&PublicKey::from_bytes(bytes), 1).encode();
            let cut = cut.min(encoded.len() - 1);
            prop_assert!(VersionMetadata::decode(&encoded[..cut]).is_err());
        }
    }
}

// ============================================================================
// Packet Validation Properties
// ============================================================================

mod packet_properties {
    use super::*;
    use mycel_core::icmpv6::packet_too_big;
    use mycel_integration_tests::ipv6_packet;

    proptest! {
        /// Packet Too Big replies never exceed the IPv6 minimum MTU
        #[test]
        fn packet_too_big_fits_minimum_mtu(
            src in any::<[u8; 16]>(),
            dst in any::<[u8; 16]>(),
            len in 0usize..4000,
        ) {
            let original = ipv6_packet(src, dst, &vec![0xab; len]);
            if let Some(reply) = packet_too_big(&original, 1280) {
                prop_assert!(reply.len() <= 1280);
                prop_assert_eq!(reply[0] >> 4, 6);
                prop_assert_eq!(&reply[8..24], &dst[..]);
                prop_assert_eq!(&reply[24..40], &src[..]);
            }
        }
    }
}
