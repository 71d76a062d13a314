//! Datum shift steps: geocentric conversion, Helmert and Molodensky.

use super::crs::{Ellipsoid, HelmertParams, MolodenskyParams};
use super::types::Coordinate;

const ARCSEC_TO_RAD: f64 = std::f64::consts::PI / (180.0 * 3600.0);

/// Iterations used by fixed-point inverses.
const INVERSE_ITERATIONS: usize = 8;

// =============================================================================
// Geocentric conversion
// =============================================================================

/// Geodetic (lon, lat degrees, h metres) to earth-centred cartesian metres.
pub fn geodetic_to_geocentric(ellipsoid: &Ellipsoid, c: Coordinate) -> [f64; 3] {
    let phi = c.y.to_radians();
    let lambda = c.x.to_radians();
    let e2 = ellipsoid.e2();
    let sin_phi = phi.sin();
    let n = ellipsoid.a / (1.0 - e2 * sin_phi * sin_phi).sqrt();
    [
        (n + c.z) * phi.cos() * lambda.cos(),
        (n + c.z) * phi.cos() * lambda.sin(),
        (n * (1.0 - e2) + c.z) * sin_phi,
    ]
}

/// Earth-centred cartesian metres back to geodetic coordinates.
pub fn geocentric_to_geodetic(ellipsoid: &Ellipsoid, xyz: [f64; 3]) -> Coordinate {
    let [x, y, z] = xyz;
    let e2 = ellipsoid.e2();
    let p = (x * x + y * y).sqrt();
    let lambda = y.atan2(x);

    let mut phi = z.atan2(p * (1.0 - e2));
    let mut h = 0.0;
    for _ in 0..10 {
        let sin_phi = phi.sin();
        let w = (1.0 - e2 * sin_phi * sin_phi).sqrt();
        let n = ellipsoid.a / w;
        h = p * phi.cos() + z * sin_phi - ellipsoid.a * w;
        let next = z.atan2(p * (1.0 - e2 * n / (n + h)));
        if (next - phi).abs() < 1e-14 {
            phi = next;
            break;
        }
        phi = next;
    }

    Coordinate::with_height(lambda.to_degrees(), phi.to_degrees(), h)
}

// =============================================================================
// Helmert
// =============================================================================

fn helmert_matrix(p: &HelmertParams) -> [[f64; 3]; 3] {
    let s = 1.0 + p.scale_ppm * 1e-6;
    let rx = p.rx * ARCSEC_TO_RAD;
    let ry = p.ry * ARCSEC_TO_RAD;
    let rz = p.rz * ARCSEC_TO_RAD;
    [
        [s, -s * rz, s * ry],
        [s * rz, s, -s * rx],
        [-s * ry, s * rx, s],
    ]
}

fn invert3(m: &[[f64; 3]; 3]) -> [[f64; 3]; 3] {
    let det = m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0]);
    let inv_det = 1.0 / det;
    [
        [
            (m[1][1] * m[2][2] - m[1][2] * m[2][1]) * inv_det,
            (m[0][2] * m[2][1] - m[0][1] * m[2][2]) * inv_det,
            (m[0][1] * m[1][2] - m[0][2] * m[1][1]) * inv_det,
        ],
        [
            (m[1][2] * m[2][0] - m[1][0] * m[2][2]) * inv_det,
            (m[0][0] * m[2][2] - m[0][2] * m[2][0]) * inv_det,
            (m[0][2] * m[1][0] - m[0][0] * m[1][2]) * inv_det,
        ],
        [
            (m[1][0] * m[2][1] - m[1][1] * m[2][0]) * inv_det,
            (m[0][1] * m[2][0] - m[0][0] * m[2][1]) * inv_det,
            (m[0][0] * m[1][1] - m[0][1] * m[1][0]) * inv_det,
        ],
    ]
}

fn mul3(m: &[[f64; 3]; 3], v: [f64; 3]) -> [f64; 3] {
    [
        m[0][0] * v[0] + m[0][1] * v[1] + m[0][2] * v[2],
        m[1][0] * v[0] + m[1][1] * v[1] + m[1][2] * v[2],
        m[2][0] * v[0] + m[2][1] * v[1] + m[2][2] * v[2],
    ]
}

/// Applies a Helmert shift between two geodetic systems.
///
/// `inverse = false` maps from the `local` ellipsoid to WGS 84, `true` maps
/// back. The inverse solves the linear system exactly.
pub fn helmert(
    params: &HelmertParams,
    local: &Ellipsoid,
    inverse: bool,
    c: Coordinate,
) -> Coordinate {
    let m = helmert_matrix(params);
    let t = [params.tx, params.ty, params.tz];
    if inverse {
        let xyz = geodetic_to_geocentric(&Ellipsoid::WGS84, c);
        let shifted = [xyz[0] - t[0], xyz[1] - t[1], xyz[2] - t[2]];
        geocentric_to_geodetic(local, mul3(&invert3(&m), shifted))
    } else {
        let xyz = geodetic_to_geocentric(local, c);
        let r = mul3(&m, xyz);
        geocentric_to_geodetic(&Ellipsoid::WGS84, [r[0] + t[0], r[1] + t[1], r[2] + t[2]])
    }
}

// =============================================================================
// Molodensky
// =============================================================================

fn molodensky_forward(params: &MolodenskyParams, from: &Ellipsoid, to: &Ellipsoid, c: Coordinate) -> Coordinate {
    let phi = c.y.to_radians();
    let lambda = c.x.to_radians();
    let h = c.z;

    let a = from.a;
    let f = from.f();
    let e2 = from.e2();
    let b = from.b();
    let da = to.a - from.a;
    let df = to.f() - f;

    let (sin_phi, cos_phi) = phi.sin_cos();
    let (sin_lam, cos_lam) = lambda.sin_cos();
    let w2 = 1.0 - e2 * sin_phi * sin_phi;
    let rn = a / w2.sqrt();
    let rm = a * (1.0 - e2) / w2.powf(1.5);

    let d_phi = (-params.dx * sin_phi * cos_lam - params.dy * sin_phi * sin_lam
        + params.dz * cos_phi
        + da * (rn * e2 * sin_phi * cos_phi) / a
        + df * (rm * a / b + rn * b / a) * sin_phi * cos_phi)
        / (rm + h);
    let d_lam = (-params.dx * sin_lam + params.dy * cos_lam) / ((rn + h) * cos_phi);
    let d_h = params.dx * cos_phi * cos_lam + params.dy * cos_phi * sin_lam + params.dz * sin_phi
        - da * a / rn
        + df * (b / a) * rn * sin_phi * sin_phi;

    Coordinate::with_height(
        (lambda + d_lam).to_degrees(),
        (phi + d_phi).to_degrees(),
        h + d_h,
    )
}

/// Applies a standard Molodensky shift.
///
/// The inverse is found by fixed-point iteration on the forward formula so
/// that a forward/inverse pair round-trips to well below a millimetre.
pub fn molodensky(
    params: &MolodenskyParams,
    local: &Ellipsoid,
    inverse: bool,
    c: Coordinate,
) -> Coordinate {
    if !inverse {
        return molodensky_forward(params, local, &Ellipsoid::WGS84, c);
    }

    let mut guess = c;
    for _ in 0..INVERSE_ITERATIONS {
        let fwd = molodensky_forward(params, local, &Ellipsoid::WGS84, guess);
        guess = Coordinate::with_height(
            guess.x + (c.x - fwd.x),
            guess.y + (c.y - fwd.y),
            guess.z + (c.z - fwd.z),
        );
    }
    guess
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::crs::{BuiltinCrsDictionary, CrsLookup, DatumShift};

    fn osgb36() -> HelmertParams {
        match BuiltinCrsDictionary::new().lookup(4277).unwrap().datum {
            DatumShift::Helmert(p) => p,
            other => panic!("unexpected datum {:?}", other),
        }
    }

    #[test]
    fn test_geocentric_round_trip() {
        let c = Coordinate::with_height(-1.5, 52.25, 125.0);
        let xyz = geodetic_to_geocentric(&Ellipsoid::WGS84, c);
        let back = geocentric_to_geodetic(&Ellipsoid::WGS84, xyz);
        assert!((back.x - c.x).abs() < 1e-11);
        assert!((back.y - c.y).abs() < 1e-11);
        assert!((back.z - c.z).abs() < 1e-6);
    }

    #[test]
    fn test_geocentric_equator() {
        let xyz = geodetic_to_geocentric(&Ellipsoid::WGS84, Coordinate::new(0.0, 0.0));
        assert!((xyz[0] - 6_378_137.0).abs() < 1e-6);
        assert!(xyz[1].abs() < 1e-6);
        assert!(xyz[2].abs() < 1e-6);
    }

    #[test]
    fn test_helmert_round_trip() {
        let p = osgb36();
        let c = Coordinate::new(-0.5, 51.5);
        let wgs = helmert(&p, &Ellipsoid::AIRY_1830, false, c);
        let back = helmert(&p, &Ellipsoid::AIRY_1830, true, wgs);
        assert!((back.x - c.x).abs() < 1e-9);
        assert!((back.y - c.y).abs() < 1e-9);
    }

    #[test]
    fn test_helmert_shift_magnitude() {
        // OSGB36 and WGS 84 differ by roughly 100 m around London.
        let c = Coordinate::new(-0.1, 51.5);
        let wgs = helmert(&osgb36(), &Ellipsoid::AIRY_1830, false, c);
        let dlon_m = (wgs.x - c.x) * 111_320.0 * 51.5_f64.to_radians().cos();
        let dlat_m = (wgs.y - c.y) * 111_320.0;
        let shift = (dlon_m * dlon_m + dlat_m * dlat_m).sqrt();
        assert!(shift > 50.0 && shift < 200.0, "shift {}", shift);
    }

    #[test]
    fn test_molodensky_round_trip() {
        let p = MolodenskyParams {
            dx: -87.0,
            dy: -98.0,
            dz: -121.0,
            accuracy_m: 10.0,
        };
        let c = Coordinate::with_height(2.3, 48.8, 50.0);
        let wgs = molodensky(&p, &Ellipsoid::INTERNATIONAL_1924, false, c);
        assert!((wgs.x - c.x).abs() > 1e-5);
        let back = molodensky(&p, &Ellipsoid::INTERNATIONAL_1924, true, wgs);
        assert!((back.x - c.x).abs() < 1e-10);
        assert!((back.y - c.y).abs() < 1e-10);
        assert!((back.z - c.z).abs() < 1e-4);
    }
}
