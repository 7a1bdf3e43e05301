//! Groups fields by endpoint tuple and packs them into minimal, quantity-bounded,
//! gap-aware Modbus read requests.

use std::collections::BTreeMap;
use std::time::Duration;

use url::Url;

use crate::constants::{MAX_READ_COILS, MAX_READ_REGISTERS};
use crate::error::{ModbusError, Result};
use crate::field::{Field, FieldType, Protocol};
use crate::frame::{encode_rtu_request, encode_tcp_request};
use crate::pdu::{FunctionCode, Request};

/// Splitter hints carried in the server URL's query string, or set directly on a structured
/// config as an alternative (per design note on URL query for splitter hints).
#[derive(Debug, Clone, Default)]
pub struct SplitterConfig {
    pub max_quantity_per_request: Option<u16>,
    pub invalid_addr: Vec<(u16, u16)>,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
}

fn parse_addr_range(token: &str) -> Result<(u16, u16)> {
    if let Some((a, b)) = token.split_once('-') {
        let start: u16 = a.trim().parse().map_err(|_| ModbusError::InvalidAddressRange(token.to_string()))?;
        let end: u16 = b.trim().parse().map_err(|_| ModbusError::InvalidAddressRange(token.to_string()))?;
        if start > end {
            return Err(ModbusError::InvalidAddressRange(token.to_string()));
        }
        Ok((start, end))
    } else {
        let v: u16 = token.trim().parse().map_err(|_| ModbusError::InvalidAddressRange(token.to_string()))?;
        Ok((v, v))
    }
}

fn parse_duration_param(s: &str) -> Result<Duration> {
    crate::config::parse_duration(s)
}

/// Parse `max_quantity_per_request`, `invalid_addr`, `read_timeout`, `write_timeout` query
/// parameters from a server URL.
pub fn parse_url_directives(server_url: &str) -> Result<SplitterConfig> {
    let url = Url::parse(server_url).or_else(|_| Url::parse(&format!("tcp://{server_url}")))?;
    let mut config = SplitterConfig::default();
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "max_quantity_per_request" => {
                config.max_quantity_per_request =
                    Some(value.parse().map_err(|_| ModbusError::Validation(format!("invalid max_quantity_per_request: {value}")))?);
            },
            "invalid_addr" => {
                for token in value.split(',') {
                    if token.trim().is_empty() {
                        continue;
                    }
                    config.invalid_addr.push(parse_addr_range(token)?);
                }
            },
            "read_timeout" => config.read_timeout = Some(parse_duration_param(&value)?),
            "write_timeout" => config.write_timeout = Some(parse_duration_param(&value)?),
            _ => {},
        }
    }
    Ok(config)
}

fn ranges_overlap(a_start: u16, a_end_inclusive: u16, ranges: &[(u16, u16)]) -> bool {
    ranges.iter().any(|&(r_start, r_end)| a_start <= r_end && r_end >= r_start && a_end_inclusive >= r_start && a_start <= r_end)
}

/// One Modbus read request produced by the splitter: endpoint tuple, protocol, address span,
/// the fields packed into it, and the pre-built request frame.
#[derive(Debug, Clone)]
pub struct BuilderRequest {
    pub server_url: String,
    pub unit_id: u8,
    pub function_code: u8,
    pub protocol: Protocol,
    pub request_interval: Duration,
    pub start_address: u16,
    pub quantity: u16,
    pub fields: Vec<Field>,
    pub request: Request,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
struct GroupKey {
    server_url: String,
    function_code: u8,
    unit_id: u8,
    protocol_tag: u8,
    interval_nanos: u128,
}

fn protocol_tag(p: Protocol) -> u8 {
    match p {
        Protocol::Any => 0,
        Protocol::Tcp => 1,
        Protocol::Rtu => 2,
    }
}

struct Slot {
    address: u16,
    size: u16,
    fields: Vec<Field>,
}

fn resolve_function_code(field: &Field, forced_function_code: Option<u8>) -> u8 {
    if field.function_code == 0 {
        if let Some(forced) = forced_function_code {
            return forced;
        }
    }
    field.function_code
}

fn resolve_protocol(field: &Field, forced_protocol: Option<Protocol>) -> Protocol {
    if field.protocol == Protocol::Any {
        if let Some(forced) = forced_protocol {
            return forced;
        }
    }
    field.protocol
}

fn default_function_code_for(field: &Field) -> u8 {
    if field.field_type.is_coil() {
        FunctionCode::ReadCoils.code()
    } else {
        FunctionCode::ReadHoldingRegisters.code()
    }
}

/// Split `fields` into the minimum set of Modbus read requests.
///
/// `forced_function_code` / `forced_protocol` apply to any field whose own function
/// code is 0 / protocol is `Any`.
pub fn split(
    fields: &[Field],
    forced_function_code: Option<u8>,
    forced_protocol: Option<Protocol>,
) -> Result<Vec<BuilderRequest>> {
    // Step 1: adopt forced code/protocol, validate, discard disagreements.
    let mut adopted: Vec<Field> = Vec::new();
    for field in fields {
        let mut f = field.clone();
        let resolved_fc = resolve_function_code(&f, forced_function_code);
        let resolved_fc = if resolved_fc == 0 { default_function_code_for(&f) } else { resolved_fc };
        let resolved_protocol = resolve_protocol(&f, forced_protocol);

        if let Some(forced) = forced_function_code {
            if field.function_code != 0 && field.function_code != forced {
                continue; // concrete function code disagrees with forced one
            }
        }
        if let Some(forced) = forced_protocol {
            if field.protocol != Protocol::Any && field.protocol != forced {
                continue;
            }
        }

        let is_coil_fc = matches!(resolved_fc, 1 | 2);
        if f.field_type.is_coil() != is_coil_fc {
            continue; // coil fields only to FC1/FC2, non-coil fields never to FC1/FC2
        }

        f.function_code = resolved_fc;
        f.protocol = resolved_protocol;
        f.validate()?;
        adopted.push(f);
    }

    // Step 2: partition into groups.
    let mut groups: BTreeMap<GroupKey, Vec<Field>> = BTreeMap::new();
    let mut order: Vec<GroupKey> = Vec::new();
    for field in adopted {
        let key = GroupKey {
            server_url: field.server_url.clone(),
            function_code: field.function_code,
            unit_id: field.unit_id,
            protocol_tag: protocol_tag(field.protocol),
            interval_nanos: field.request_interval.as_nanos(),
        };
        if !groups.contains_key(&key) {
            order.push(key.clone());
        }
        groups.entry(key).or_default().push(field);
    }

    let mut requests = Vec::new();
    for key in order {
        let group_fields = groups.remove(&key).unwrap();
        let directives = parse_url_directives(&key.server_url)?;
        let is_coil_group = matches!(key.function_code, 1 | 2);
        let natural_cap = if is_coil_group { MAX_READ_COILS } else { MAX_READ_REGISTERS };
        let cap = directives
            .max_quantity_per_request
            .map_or(natural_cap, |n| n.min(natural_cap));

        // Each field must not overlap its own declared forbidden range.
        for field in &group_fields {
            let size = field.register_size() as u16;
            let last = field.address.saturating_add(size.saturating_sub(1));
            if ranges_overlap(field.address, last, &directives.invalid_addr) {
                return Err(ModbusError::OverlapsInvalidRange(format!(
                    "field {} at address {} overlaps a forbidden range",
                    field.name, field.address
                )));
            }
        }

        // Step 3: merge same-address fields into slots.
        let mut slots: BTreeMap<u16, Slot> = BTreeMap::new();
        for field in group_fields {
            let size = field.register_size() as u16;
            let slot = slots.entry(field.address).or_insert_with(|| Slot {
                address: field.address,
                size: 0,
                fields: Vec::new(),
            });
            slot.size = slot.size.max(size);
            slot.fields.push(field);
        }
        // Step 4: sorted by construction (BTreeMap is sorted by key).
        let mut slots: Vec<Slot> = slots.into_values().collect();
        slots.sort_by_key(|s| s.address);

        // Step 5/6: walk slots building batches.
        let mut batches: Vec<(u16, u16, Vec<Field>)> = Vec::new();
        let mut current: Option<(u16, u16, Vec<Field>)> = None;
        for slot in slots {
            let slot_last = slot.address.saturating_add(slot.size.saturating_sub(1));
            if let Some((start, qty, _)) = current {
                let current_last = start + qty - 1;
                let candidate_last = slot_last.max(current_last);
                let candidate_qty = candidate_last - start + 1;
                let overlaps_forbidden = ranges_overlap(start, candidate_last, &directives.invalid_addr);
                if candidate_qty > cap || overlaps_forbidden {
                    batches.push(current.take().unwrap());
                }
            }
            match &mut current {
                Some((start, qty, fields)) => {
                    let new_last = slot_last.max(*start + *qty - 1);
                    *qty = new_last - *start + 1;
                    fields.extend(slot.fields);
                },
                None => {
                    current = Some((slot.address, slot.size, slot.fields));
                },
            }
        }
        if let Some(batch) = current {
            batches.push(batch);
        }

        // Step 7: build the concrete frame per batch.
        for (start_address, quantity, batch_fields) in batches {
            let request = if is_coil_group {
                if key.function_code == 1 {
                    Request::ReadCoils { start_address, quantity }
                } else {
                    Request::ReadDiscreteInputs { start_address, quantity }
                }
            } else if key.function_code == 4 {
                Request::ReadInputRegisters { start_address, quantity }
            } else {
                Request::ReadHoldingRegisters { start_address, quantity }
            };
            // Validate the frame encodes cleanly for at least one protocol; the transport
            // picks TCP vs RTU encoding at send time based on `protocol`.
            let _ = encode_tcp_request(&request, key.unit_id)?;
            let _ = encode_rtu_request(&request, key.unit_id)?;

            let protocol = match key.protocol_tag {
                1 => Protocol::Tcp,
                2 => Protocol::Rtu,
                _ => Protocol::Any,
            };
            requests.push(BuilderRequest {
                server_url: key.server_url.clone(),
                unit_id: key.unit_id,
                function_code: key.function_code,
                protocol,
                request_interval: Duration::from_nanos(key.interval_nanos as u64),
                start_address,
                quantity,
                fields: batch_fields,
                request,
            });
        }
    }

    if requests.is_empty() {
        return Err(ModbusError::NoRequests);
    }
    Ok(requests)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::byte_order::ByteOrder;

    fn field(name: &str, addr: u16, field_type: FieldType) -> Field {
        Field {
            name: name.into(),
            server_url: "tcp://127.0.0.1:502".into(),
            unit_id: 1,
            function_code: 0,
            protocol: Protocol::Any,
            request_interval: Duration::from_secs(1),
            address: addr,
            field_type,
            bit: None,
            from_high_byte: false,
            length: None,
            byte_order: ByteOrder::BigEndian,
            invalid: None,
        }
    }

    #[test]
    fn scenario_1_fc3_single_request() {
        let mut int64_field = field("a", 18, FieldType::Int64);
        int64_field.function_code = 3;
        let mut u16_field = field("b", 19, FieldType::Uint16);
        u16_field.function_code = 3;
        let requests = split(&[int64_field, u16_field], None, None).unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].start_address, 18);
        assert_eq!(requests[0].quantity, 4);
    }

    #[test]
    fn scenario_3_split_crossing_max_quantity() {
        let fields: Vec<Field> = (0..200u16)
            .map(|addr| {
                let mut f = field(&format!("f{addr}"), addr, FieldType::Uint16);
                f.function_code = 3;
                f.server_url = "tcp://127.0.0.1:502?max_quantity_per_request=100".into();
                f
            })
            .collect();
        let requests = split(&fields, None, None).unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!((requests[0].start_address, requests[0].quantity), (0, 100));
        assert_eq!((requests[1].start_address, requests[1].quantity), (100, 100));
    }

    #[test]
    fn scenario_4_split_avoiding_invalid_range_fails_field() {
        let url = "tcp://127.0.0.1:502?invalid_addr=40-120";
        let mut fields = vec![
            field("a", 5, FieldType::Uint16),
            field("b", 50, FieldType::Uint16),
            field("c", 150, FieldType::Uint16),
        ];
        for f in &mut fields {
            f.server_url = url.into();
            f.function_code = 3;
        }
        let err = split(&fields, None, None).unwrap_err();
        assert!(matches!(err, ModbusError::OverlapsInvalidRange(_)));
    }

    #[test]
    fn coil_fields_never_mix_with_register_fields() {
        let mut coil = field("coil", 10, FieldType::Coil);
        coil.function_code = 1;
        let mut reg = field("reg", 10, FieldType::Uint16);
        reg.function_code = 3;
        let requests = split(&[coil, reg], None, None).unwrap();
        assert_eq!(requests.len(), 2);
        assert_ne!(requests[0].function_code, requests[1].function_code);
    }

    #[test]
    fn quantity_never_exceeds_hard_cap() {
        let fields: Vec<Field> = (0..300u16)
            .map(|addr| {
                let mut f = field(&format!("f{addr}"), addr, FieldType::Uint16);
                f.function_code = 3;
                f
            })
            .collect();
        let requests = split(&fields, None, None).unwrap();
        for r in requests {
            assert!(r.quantity <= MAX_READ_REGISTERS);
        }
    }

    #[test]
    fn empty_split_fails() {
        assert!(matches!(split(&[], None, None).unwrap_err(), ModbusError::NoRequests));
    }
}
