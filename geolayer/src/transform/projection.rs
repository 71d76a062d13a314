//! Map projections.
//!
//! Transverse Mercator uses the Krüger series to sixth order in the third
//! flattening, which keeps round-trip error well below a millimetre across a
//! UTM zone.

use super::crs::{Ellipsoid, TransverseMercatorParams};
use super::TransformError;

/// Latitude limit of the square Web Mercator world.
pub const WEB_MERCATOR_MAX_LAT: f64 = 85.051_128_779_806_59;

// =============================================================================
// Web Mercator
// =============================================================================

/// Geographic degrees to Web Mercator metres. Latitude is clamped.
pub fn web_mercator_forward(ellipsoid: &Ellipsoid, lon: f64, lat: f64) -> (f64, f64) {
    let lat = lat.clamp(-WEB_MERCATOR_MAX_LAT, WEB_MERCATOR_MAX_LAT);
    let x = ellipsoid.a * lon.to_radians();
    let y = ellipsoid.a * (std::f64::consts::FRAC_PI_4 + lat.to_radians() / 2.0).tan().ln();
    (x, y)
}

/// Web Mercator metres to geographic degrees.
pub fn web_mercator_inverse(ellipsoid: &Ellipsoid, x: f64, y: f64) -> (f64, f64) {
    let lon = (x / ellipsoid.a).to_degrees();
    let lat = (2.0 * (y / ellipsoid.a).exp().atan() - std::f64::consts::FRAC_PI_2).to_degrees();
    (lon, lat)
}

// =============================================================================
// Transverse Mercator
// =============================================================================

/// Precomputed Krüger series for one ellipsoid and parameter set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransverseMercator {
    params: TransverseMercatorParams,
    e: f64,
    /// Rectifying radius scaled by k0.
    k0a: f64,
    alpha: [f64; 6],
    beta: [f64; 6],
    /// Scaled meridian arc from the equator to the latitude of origin.
    m0: f64,
}

impl TransverseMercator {
    pub fn new(ellipsoid: &Ellipsoid, params: TransverseMercatorParams) -> Self {
        let f = ellipsoid.f();
        let e = (f * (2.0 - f)).sqrt();
        let n = f / (2.0 - f);
        let n2 = n * n;
        let n3 = n2 * n;
        let n4 = n3 * n;
        let n5 = n4 * n;
        let n6 = n5 * n;

        let a_rect = ellipsoid.a / (1.0 + n) * (1.0 + n2 / 4.0 + n4 / 64.0 + n6 / 256.0);

        let alpha = [
            n / 2.0 - 2.0 / 3.0 * n2 + 5.0 / 16.0 * n3 + 41.0 / 180.0 * n4 - 127.0 / 288.0 * n5
                + 7891.0 / 37800.0 * n6,
            13.0 / 48.0 * n2 - 3.0 / 5.0 * n3 + 557.0 / 1440.0 * n4 + 281.0 / 630.0 * n5
                - 1983433.0 / 1935360.0 * n6,
            61.0 / 240.0 * n3 - 103.0 / 140.0 * n4 + 15061.0 / 26880.0 * n5
                + 167603.0 / 181440.0 * n6,
            49561.0 / 161280.0 * n4 - 179.0 / 168.0 * n5 + 6601661.0 / 7257600.0 * n6,
            34729.0 / 80640.0 * n5 - 3418889.0 / 1995840.0 * n6,
            212378941.0 / 319334400.0 * n6,
        ];
        let beta = [
            n / 2.0 - 2.0 / 3.0 * n2 + 37.0 / 96.0 * n3 - 1.0 / 360.0 * n4 - 81.0 / 512.0 * n5
                + 96199.0 / 604800.0 * n6,
            1.0 / 48.0 * n2 + 1.0 / 15.0 * n3 - 437.0 / 1440.0 * n4 + 46.0 / 105.0 * n5
                - 1118711.0 / 3870720.0 * n6,
            17.0 / 480.0 * n3 - 37.0 / 840.0 * n4 - 209.0 / 4480.0 * n5 + 5569.0 / 90720.0 * n6,
            4397.0 / 161280.0 * n4 - 11.0 / 504.0 * n5 - 830251.0 / 7257600.0 * n6,
            4583.0 / 161280.0 * n5 - 108847.0 / 3991680.0 * n6,
            20648693.0 / 638668800.0 * n6,
        ];

        let mut tm = Self {
            params,
            e,
            k0a: params.k0 * a_rect,
            alpha,
            beta,
            m0: 0.0,
        };
        let (_, m0) = tm.gauss_krueger(params.lat0.to_radians(), 0.0);
        tm.m0 = m0;
        tm
    }

    /// Conformal latitude tangent for a geodetic latitude tangent.
    fn conformal_tau(&self, tau: f64) -> f64 {
        let sigma = (self.e * (self.e * tau / (1.0 + tau * tau).sqrt()).atanh()).sinh();
        tau * (1.0 + sigma * sigma).sqrt() - sigma * (1.0 + tau * tau).sqrt()
    }

    /// Scaled (easting, northing) before false origin, λ relative to lon0.
    fn gauss_krueger(&self, phi: f64, lambda: f64) -> (f64, f64) {
        let tau_p = self.conformal_tau(phi.tan());
        let cos_l = lambda.cos();
        let xi_p = tau_p.atan2(cos_l);
        let eta_p = (lambda.sin() / (tau_p * tau_p + cos_l * cos_l).sqrt()).asinh();

        let mut xi = xi_p;
        let mut eta = eta_p;
        for (j, a) in self.alpha.iter().enumerate() {
            let k = 2.0 * (j + 1) as f64;
            xi += a * (k * xi_p).sin() * (k * eta_p).cosh();
            eta += a * (k * xi_p).cos() * (k * eta_p).sinh();
        }
        (self.k0a * eta, self.k0a * xi)
    }

    /// Geographic degrees to projected metres.
    pub fn forward(&self, lon: f64, lat: f64) -> Result<(f64, f64), TransformError> {
        if lat.abs() > 90.0 {
            return Err(TransformError::InvalidCoordinate(format!(
                "latitude {} out of range",
                lat
            )));
        }
        let mut dlon = lon - self.params.lon0;
        dlon = (dlon + 540.0).rem_euclid(360.0) - 180.0;
        if dlon.abs() >= 90.0 {
            return Err(TransformError::InvalidCoordinate(format!(
                "longitude {} is more than 90 degrees from the central meridian",
                lon
            )));
        }
        // tan(±90°) is fine for the series but the pole itself must stay finite.
        let phi = lat.to_radians().clamp(-1.570_796_326_7, 1.570_796_326_7);
        let (x, y) = self.gauss_krueger(phi, dlon.to_radians());
        Ok((
            x + self.params.false_easting,
            y - self.m0 + self.params.false_northing,
        ))
    }

    /// Projected metres to geographic degrees.
    pub fn inverse(&self, easting: f64, northing: f64) -> Result<(f64, f64), TransformError> {
        let xi = (northing - self.params.false_northing + self.m0) / self.k0a;
        let eta = (easting - self.params.false_easting) / self.k0a;

        let mut xi_p = xi;
        let mut eta_p = eta;
        for (j, b) in self.beta.iter().enumerate() {
            let k = 2.0 * (j + 1) as f64;
            xi_p -= b * (k * xi).sin() * (k * eta).cosh();
            eta_p -= b * (k * xi).cos() * (k * eta).sinh();
        }

        let sinh_eta = eta_p.sinh();
        let sin_xi = xi_p.sin();
        let cos_xi = xi_p.cos();
        let tau_p = sin_xi / (sinh_eta * sinh_eta + cos_xi * cos_xi).sqrt();

        let e2 = self.e * self.e;
        let mut tau = tau_p;
        for _ in 0..20 {
            let tau_i_p = self.conformal_tau(tau);
            let delta = (tau_p - tau_i_p) / (1.0 + tau_i_p * tau_i_p).sqrt()
                * (1.0 + (1.0 - e2) * tau * tau)
                / ((1.0 - e2) * (1.0 + tau * tau).sqrt());
            tau += delta;
            if delta.abs() < 1e-12 {
                break;
            }
        }

        let lat = tau.atan().to_degrees();
        let lon = self.params.lon0 + sinh_eta.atan2(cos_xi).to_degrees();
        if !lat.is_finite() || !lon.is_finite() {
            return Err(TransformError::InvalidCoordinate(format!(
                "({}, {}) is outside the projection domain",
                easting, northing
            )));
        }
        Ok((lon, lat))
    }
}
