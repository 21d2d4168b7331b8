//! Decode and encode Mapbox Vector Tiles.
//!
//! The wire format is the standard MVT protobuf schema
//! (`vector_tile.proto`), expressed here directly as `prost::Message`
//! derives rather than compiled from a `.proto` file through
//! `prost-build`; there is exactly one small, stable schema to maintain
//! and no other consumer needs the generated Rust types, so a build step
//! buys nothing. `prost` is already part of the dependency stack.
//!
//! Auto-scaling to a normalised 256 coordinate frame is never performed:
//! callers pass and receive integer coordinates already in the tile's
//! native pixel frame, and the `extent` field on each layer simply
//! records that frame's size for downstream consumers.

use std::collections::BTreeMap;

use prost::Message;

use crate::error::CodecError;

mod wire {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Tile {
        #[prost(message, repeated, tag = "3")]
        pub layers: Vec<Layer>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct Layer {
        #[prost(uint32, tag = "15", default = "1")]
        pub version: u32,
        #[prost(string, tag = "1")]
        pub name: String,
        #[prost(message, repeated, tag = "2")]
        pub features: Vec<Feature>,
        #[prost(string, repeated, tag = "3")]
        pub keys: Vec<String>,
        #[prost(message, repeated, tag = "4")]
        pub values: Vec<Value>,
        #[prost(uint32, tag = "5", default = "4096")]
        pub extent: u32,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct Feature {
        #[prost(uint64, optional, tag = "1")]
        pub id: Option<u64>,
        #[prost(uint32, repeated, packed = "true", tag = "2")]
        pub tags: Vec<u32>,
        #[prost(enumeration = "GeomType", optional, tag = "3")]
        pub r#type: Option<i32>,
        #[prost(uint32, repeated, packed = "true", tag = "4")]
        pub geometry: Vec<u32>,
    }

    #[derive(Clone, PartialEq, Eq, Hash, Message)]
    pub struct Value {
        #[prost(string, optional, tag = "1")]
        pub string_value: Option<String>,
        #[prost(int64, optional, tag = "4")]
        pub int_value: Option<i64>,
        #[prost(uint64, optional, tag = "5")]
        pub uint_value: Option<u64>,
        #[prost(sint64, optional, tag = "6")]
        pub sint_value: Option<i64>,
        #[prost(bool, optional, tag = "7")]
        pub bool_value: Option<bool>,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
    #[repr(i32)]
    pub enum GeomType {
        Unknown = 0,
        Point = 1,
        LineString = 2,
        Polygon = 3,
    }
}

/// A decoded or to-be-encoded feature geometry, in tile-local integer
/// pixel space. Polygon rings must not repeat their first vertex; closure
/// is implicit, matching the MVT command stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Geometry {
    Point(i32, i32),
    MultiPoint(Vec<(i32, i32)>),
    Polygon(Vec<Vec<(i32, i32)>>),
}

impl Geometry {
    fn geom_type(&self) -> wire::GeomType {
        match self {
            Geometry::Point(..) | Geometry::MultiPoint(_) => wire::GeomType::Point,
            Geometry::Polygon(_) => wire::GeomType::Polygon,
        }
    }

    /// Axis-aligned bounding box, `(min_x, min_y, max_x, max_y)`.
    fn bbox(&self) -> (i32, i32, i32, i32) {
        let points: Vec<(i32, i32)> = match self {
            Geometry::Point(x, y) => vec![(*x, *y)],
            Geometry::MultiPoint(pts) => pts.clone(),
            Geometry::Polygon(rings) => rings.iter().flatten().copied().collect(),
        };
        points.into_iter().fold(
            (i32::MAX, i32::MAX, i32::MIN, i32::MIN),
            |(minx, miny, maxx, maxy), (x, y)| {
                (minx.min(x), miny.min(y), maxx.max(x), maxy.max(y))
            },
        )
    }
}

/// An attribute value, mirroring MVT's tagged-union `Value` message.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    String(String),
    Int(i64),
    UInt(u64),
    Bool(bool),
}

impl From<&wire::Value> for AttrValue {
    fn from(v: &wire::Value) -> Self {
        if let Some(s) = &v.string_value {
            AttrValue::String(s.clone())
        } else if let Some(i) = v.sint_value {
            AttrValue::Int(i)
        } else if let Some(i) = v.int_value {
            AttrValue::Int(i)
        } else if let Some(u) = v.uint_value {
            AttrValue::UInt(u)
        } else if let Some(b) = v.bool_value {
            AttrValue::Bool(b)
        } else {
            AttrValue::String(String::new())
        }
    }
}

impl From<&AttrValue> for wire::Value {
    fn from(v: &AttrValue) -> Self {
        let mut out = wire::Value::default();
        match v {
            AttrValue::String(s) => out.string_value = Some(s.clone()),
            AttrValue::Int(i) => out.sint_value = Some(*i),
            AttrValue::UInt(u) => out.uint_value = Some(*u),
            AttrValue::Bool(b) => out.bool_value = Some(*b),
        }
        out
    }
}

/// A decoded feature. Attributes are kept in a `BTreeMap` so iteration is
/// always in lexical key order, matching the Assembler's determinism
/// requirement.
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub id: Option<u64>,
    pub geometry: Geometry,
    pub attributes: BTreeMap<String, AttrValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    pub name: String,
    pub extent: u32,
    pub features: Vec<Feature>,
}

/// Decode raw MVT bytes into layers. Coordinates are returned in the
/// tile's native integer pixel frame.
pub fn decode(bytes: &[u8]) -> Result<Vec<Layer>, CodecError> {
    let tile =
        wire::Tile::decode(bytes).map_err(|e| CodecError::new(format!("malformed tile: {e}")))?;

    let mut layers = Vec::with_capacity(tile.layers.len());
    for wire_layer in &tile.layers {
        let mut features = Vec::with_capacity(wire_layer.features.len());
        for wire_feature in &wire_layer.features {
            let geom_type = wire_feature
                .r#type
                .and_then(|v| wire::GeomType::try_from(v).ok())
                .unwrap_or(wire::GeomType::Unknown);
            let geometry = decode_geometry(geom_type, &wire_feature.geometry)?;

            let mut attributes = BTreeMap::new();
            for pair in wire_feature.tags.chunks_exact(2) {
                let key_idx = pair[0] as usize;
                let val_idx = pair[1] as usize;
                let key = wire_layer.keys.get(key_idx).ok_or_else(|| {
                    CodecError::new(format!("tag key index {key_idx} out of range"))
                })?;
                let value = wire_layer.values.get(val_idx).ok_or_else(|| {
                    CodecError::new(format!("tag value index {val_idx} out of range"))
                })?;
                attributes.insert(key.clone(), AttrValue::from(value));
            }

            features.push(Feature {
                id: wire_feature.id,
                geometry,
                attributes,
            });
        }

        layers.push(Layer {
            name: wire_layer.name.clone(),
            extent: wire_layer.extent,
            features,
        });
    }

    Ok(layers)
}

/// Encode layers into a valid MVT byte stream. Features whose geometry
/// lies entirely outside `[-bufferSize, tileSize+bufferSize]` on either
/// axis are dropped silently.
pub fn encode(layers: &[Layer], tile_size: u32, buffer_size: u32) -> Result<Vec<u8>, CodecError> {
    let lo = -(i64::from(buffer_size));
    let hi = i64::from(tile_size) + i64::from(buffer_size);

    let mut wire_tile = wire::Tile::default();

    for layer in layers {
        let mut wire_layer = wire::Layer {
            version: 2,
            name: layer.name.clone(),
            extent: layer.extent,
            ..Default::default()
        };

        let mut key_index: BTreeMap<String, u32> = BTreeMap::new();
        let mut value_index: Vec<wire::Value> = Vec::new();
        let mut value_lookup: BTreeMap<(String, String), u32> = BTreeMap::new();

        for feature in &layer.features {
            let (minx, miny, maxx, maxy) = feature.geometry.bbox();
            let outside_x = i64::from(maxx) < lo || i64::from(minx) > hi;
            let outside_y = i64::from(maxy) < lo || i64::from(miny) > hi;
            if outside_x || outside_y {
                continue;
            }

            let geometry = encode_geometry(&feature.geometry);
            let mut tags = Vec::with_capacity(feature.attributes.len() * 2);

            for (key, value) in &feature.attributes {
                let key_idx = *key_index.entry(key.clone()).or_insert_with(|| {
                    wire_layer.keys.push(key.clone());
                    (wire_layer.keys.len() - 1) as u32
                });

                let value_key = (key.clone(), format!("{value:?}"));
                let value_idx = *value_lookup.entry(value_key).or_insert_with(|| {
                    value_index.push(wire::Value::from(value));
                    (value_index.len() - 1) as u32
                });

                tags.push(key_idx);
                tags.push(value_idx);
            }

            wire_layer.features.push(wire::Feature {
                id: feature.id,
                tags,
                r#type: Some(feature.geometry.geom_type() as i32),
                geometry,
            });
        }

        wire_layer.values = value_index;
        wire_tile.layers.push(wire_layer);
    }

    let mut buf = Vec::with_capacity(wire_tile.encoded_len());
    wire_tile
        .encode(&mut buf)
        .map_err(|e| CodecError::new(format!("failed to encode tile: {e}")))?;
    Ok(buf)
}

const CMD_MOVE_TO: u32 = 1;
const CMD_LINE_TO: u32 = 2;
const CMD_CLOSE_PATH: u32 = 7;

fn command_integer(id: u32, count: u32) -> u32 {
    (id & 0x7) | (count << 3)
}

fn zigzag_encode(v: i32) -> u32 {
    ((v << 1) ^ (v >> 31)) as u32
}

fn zigzag_decode(v: u32) -> i32 {
    ((v >> 1) as i32) ^ -((v & 1) as i32)
}

fn encode_geometry(geometry: &Geometry) -> Vec<u32> {
    let mut out = Vec::new();
    let mut cursor = (0i32, 0i32);

    let mut emit_point = |out: &mut Vec<u32>, cursor: &mut (i32, i32), x: i32, y: i32| {
        out.push(zigzag_encode(x - cursor.0));
        out.push(zigzag_encode(y - cursor.1));
        *cursor = (x, y);
    };

    match geometry {
        Geometry::Point(x, y) => {
            out.push(command_integer(CMD_MOVE_TO, 1));
            emit_point(&mut out, &mut cursor, *x, *y);
        }
        Geometry::MultiPoint(points) => {
            out.push(command_integer(CMD_MOVE_TO, points.len() as u32));
            for (x, y) in points {
                emit_point(&mut out, &mut cursor, *x, *y);
            }
        }
        Geometry::Polygon(rings) => {
            for ring in rings {
                if ring.is_empty() {
                    continue;
                }
                out.push(command_integer(CMD_MOVE_TO, 1));
                emit_point(&mut out, &mut cursor, ring[0].0, ring[0].1);

                if ring.len() > 1 {
                    out.push(command_integer(CMD_LINE_TO, (ring.len() - 1) as u32));
                    for (x, y) in &ring[1..] {
                        emit_point(&mut out, &mut cursor, *x, *y);
                    }
                }
                out.push(command_integer(CMD_CLOSE_PATH, 1));
            }
        }
    }

    out
}

fn decode_geometry(geom_type: wire::GeomType, cmds: &[u32]) -> Result<Geometry, CodecError> {
    let mut cursor = (0i32, 0i32);
    let mut idx = 0usize;
    let mut points: Vec<(i32, i32)> = Vec::new();
    let mut rings: Vec<Vec<(i32, i32)>> = Vec::new();
    let mut current_ring: Vec<(i32, i32)> = Vec::new();

    while idx < cmds.len() {
        let cmd_int = cmds[idx];
        idx += 1;
        let id = cmd_int & 0x7;
        let count = cmd_int >> 3;

        match id {
            c if c == CMD_MOVE_TO => {
                if !current_ring.is_empty() {
                    rings.push(std::mem::take(&mut current_ring));
                }
                for _ in 0..count {
                    let dx = zigzag_decode(*cmds.get(idx).ok_or_else(|| {
                        CodecError::new("truncated geometry (MoveTo x)")
                    })?);
                    let dy = zigzag_decode(*cmds.get(idx + 1).ok_or_else(|| {
                        CodecError::new("truncated geometry (MoveTo y)")
                    })?);
                    idx += 2;
                    cursor = (cursor.0 + dx, cursor.1 + dy);
                    match geom_type {
                        wire::GeomType::Point => points.push(cursor),
                        _ => current_ring.push(cursor),
                    }
                }
            }
            c if c == CMD_LINE_TO => {
                for _ in 0..count {
                    let dx = zigzag_decode(*cmds.get(idx).ok_or_else(|| {
                        CodecError::new("truncated geometry (LineTo x)")
                    })?);
                    let dy = zigzag_decode(*cmds.get(idx + 1).ok_or_else(|| {
                        CodecError::new("truncated geometry (LineTo y)")
                    })?);
                    idx += 2;
                    cursor = (cursor.0 + dx, cursor.1 + dy);
                    current_ring.push(cursor);
                }
            }
            c if c == CMD_CLOSE_PATH => {
                if !current_ring.is_empty() {
                    rings.push(std::mem::take(&mut current_ring));
                }
            }
            other => {
                return Err(CodecError::new(format!("unknown geometry command {other}")));
            }
        }
    }

    if !current_ring.is_empty() {
        rings.push(current_ring);
    }

    match geom_type {
        wire::GeomType::Point if points.len() == 1 => Ok(Geometry::Point(points[0].0, points[0].1)),
        wire::GeomType::Point => Ok(Geometry::MultiPoint(points)),
        wire::GeomType::Polygon => Ok(Geometry::Polygon(rings)),
        wire::GeomType::LineString => Err(CodecError::new(
            "line string geometries are not used by this service",
        )),
        wire::GeomType::Unknown => Err(CodecError::new("feature has unknown geometry type")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_layer() -> Layer {
        let mut attrs = BTreeMap::new();
        attrs.insert("2020".to_string(), AttrValue::Int(12));
        attrs.insert("name".to_string(), AttrValue::String("abc".to_string()));

        Layer {
            name: "occurrence".to_string(),
            extent: 512,
            features: vec![
                Feature {
                    id: Some(1),
                    geometry: Geometry::Point(100, 200),
                    attributes: attrs.clone(),
                },
                Feature {
                    id: Some(2),
                    geometry: Geometry::Polygon(vec![vec![
                        (0, 0),
                        (10, 0),
                        (10, 10),
                        (0, 10),
                    ]]),
                    attributes: attrs,
                },
            ],
        }
    }

    #[test]
    fn round_trip_preserves_features() {
        let layers = vec![sample_layer()];
        let bytes = encode(&layers, 512, 64).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, layers);
    }

    #[test]
    fn empty_tile_encodes_to_tiny_valid_tile() {
        let bytes = encode(&[], 512, 64).unwrap();
        assert!(bytes.len() <= 4);
        let decoded = decode(&bytes).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn features_entirely_outside_buffer_are_dropped() {
        let mut layer = sample_layer();
        layer.features.push(Feature {
            id: Some(3),
            geometry: Geometry::Point(100_000, 100_000),
            attributes: BTreeMap::new(),
        });

        let bytes = encode(&[layer], 512, 64).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded[0].features.len(), 2);
    }

    #[test]
    fn decode_rejects_truncated_bytes() {
        let bytes = encode(&[sample_layer()], 512, 64).unwrap();
        let truncated = &bytes[..bytes.len() / 2];
        assert!(decode(truncated).is_err());
    }

    #[test]
    fn zigzag_round_trips() {
        for v in [-1000, -1, 0, 1, 1000, i32::MIN / 2, i32::MAX / 2] {
            assert_eq!(zigzag_decode(zigzag_encode(v)), v);
        }
    }
}
