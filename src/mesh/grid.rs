//! Japanese standard grid (JIS X 0410) helpers at half-mesh resolution.
//!
//! A half-mesh id has nine digits `PPUUQVRWM`: the 1st-mesh code `PPUU`,
//! the 2nd-mesh row/column `Q`/`V` (0..8), the 3rd-mesh row/column `R`/`W`
//! (0..10) and the quadrant `M` (1..=4, south-west first).

use anyhow::{bail, Result};

/// Half-mesh cells inside one 1st-mesh: 8 * 8 * 10 * 10 * 4.
pub const CELLS_PER_FIRST_MESH: usize = 25_600;

/// Latitude span of a half-mesh cell in degrees (15 arc-seconds).
const HALF_LAT: f64 = 15.0 / 3600.0;
/// Longitude span of a half-mesh cell in degrees (22.5 arc-seconds).
const HALF_LON: f64 = 22.5 / 3600.0;

/// A WGS84-ish longitude/latitude pair in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinates {
    pub lon: f64,
    pub lat: f64,
}

/// Every half-mesh id inside 1st-mesh `first_mesh`, in canonical order
/// (2nd-mesh row, 2nd-mesh column, 3rd-mesh row, 3rd-mesh column, quadrant).
pub fn first_mesh_cells(first_mesh: u32) -> Result<Vec<u32>> {
    if !(1000..=9999).contains(&first_mesh) {
        bail!("1st-mesh code must have four digits, got {first_mesh}");
    }

    let mut ids = Vec::with_capacity(CELLS_PER_FIRST_MESH);
    let base = first_mesh * 100_000;
    for q in 0..8 {
        for v in 0..8 {
            for r in 0..10 {
                for w in 0..10 {
                    for m in 1..=4 {
                        ids.push(base + q * 10_000 + v * 1_000 + r * 100 + w * 10 + m);
                    }
                }
            }
        }
    }

    Ok(ids)
}

/// Half-mesh id containing `(lon, lat)`, or `None` outside the grid's domain.
pub fn cell_at(lon: f64, lat: f64) -> Option<u32> {
    if !(0.0..66.0).contains(&lat) || !(100.0..200.0).contains(&lon) {
        return None;
    }

    let (p, q, r, s) = split_axis(lat * 1.5);
    let (u, v, w, x) = split_axis(lon - 100.0);
    let m = s * 2 + x + 1;

    Some(p * 10_000_000 + u * 100_000 + q * 10_000 + v * 1_000 + r * 100 + w * 10 + m)
}

/// Centre of half-mesh `id`, or `None` if `id` is not a well-formed code.
pub fn cell_center(id: u32) -> Option<Coordinates> {
    let m = id % 10;
    let w = (id / 10) % 10;
    let r = (id / 100) % 10;
    let v = (id / 1_000) % 10;
    let q = (id / 10_000) % 10;
    let u = (id / 100_000) % 100;
    let p = id / 10_000_000;

    if !(1..=4).contains(&m) || q >= 8 || v >= 8 || p >= 100 {
        return None;
    }

    let s = (m - 1) / 2;
    let x = (m - 1) % 2;

    let lat = (p as f64 + q as f64 / 8.0 + r as f64 / 80.0 + s as f64 / 160.0) * 40.0 / 60.0
        + HALF_LAT / 2.0;
    let lon = 100.0
        + u as f64
        + v as f64 / 8.0
        + w as f64 / 80.0
        + x as f64 / 160.0
        + HALF_LON / 2.0;

    Some(Coordinates { lon, lat })
}

/// Split a scaled axis value into 1st/2nd/3rd-mesh digits and the half bit.
fn split_axis(value: f64) -> (u32, u32, u32, u32) {
    let first = value.floor();
    let rest = (value - first) * 8.0;
    let second = rest.floor();
    let rest = (rest - second) * 10.0;
    let third = rest.floor();
    let half = ((rest - third) * 2.0).floor();
    (first as u32, second as u32, third as u32, half as u32)
}
