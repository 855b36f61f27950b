mod entity_address;
mod entity_id;
mod region_address;
mod shard_id;
mod type_name;

pub use entity_address::EntityAddress;
pub use entity_id::EntityId;
pub use region_address::RegionAddress;
pub use shard_id::ShardId;
pub use type_name::TypeName;

#[cfg(test)]
mod tests {
    use super::*;

    macro_rules! serde_round_trip {
        ($name:ident, $val:expr) => {
            mod $name {
                use super::*;

                #[test]
                fn msgpack() {
                    let val = $val;
                    let bytes = rmp_serde::to_vec(&val).unwrap();
                    let decoded = rmp_serde::from_slice(&bytes).unwrap();
                    assert_eq!(val, decoded);
                }

                #[test]
                fn json() {
                    let val = $val;
                    let json = serde_json::to_string(&val).unwrap();
                    let decoded = serde_json::from_str(&json).unwrap();
                    assert_eq!(val, decoded);
                }
            }
        };
    }

    serde_round_trip!(type_name, TypeName::new("User"));
    serde_round_trip!(entity_id, EntityId::new("abc-123"));
    serde_round_trip!(shard_id, ShardId::new("7"));
    serde_round_trip!(region_address, RegionAddress::new("10.0.0.1", 9000));
    serde_round_trip!(
        entity_address,
        EntityAddress {
            type_name: TypeName::new("Order"),
            shard_id: ShardId::new("1"),
            entity_id: EntityId::new("ord-1"),
        }
    );

    #[test]
    fn region_address_orders_by_host_then_port() {
        let mut addrs = vec![
            RegionAddress::new("b", 1),
            RegionAddress::new("a", 2),
            RegionAddress::new("a", 1),
        ];
        addrs.sort();
        assert_eq!(
            addrs,
            vec![
                RegionAddress::new("a", 1),
                RegionAddress::new("a", 2),
                RegionAddress::new("b", 1),
            ]
        );
    }

    #[test]
    fn display_formats() {
        assert_eq!(RegionAddress::new("host", 80).to_string(), "host:80");
        let addr = EntityAddress {
            type_name: TypeName::new("Cart"),
            shard_id: ShardId::new("3"),
            entity_id: EntityId::new("c-9"),
        };
        assert_eq!(addr.to_string(), "Cart/3/c-9");
    }
}
