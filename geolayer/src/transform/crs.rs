//! Coordinate reference system definitions and the CRS dictionary seam.
//!
//! The engine never owns an EPSG database. It asks a [`CrsLookup`] for a
//! definition the first time a code is used and keeps the result for the
//! lifetime of the engine. [`BuiltinCrsDictionary`] covers the systems the
//! rest of the crate and its tests depend on.

/// Code of the WGS 84 geographic system every datum shift is expressed against.
pub const WGS84: u32 = 4326;

/// Code of the spherical Web Mercator system used by slippy-map tiles.
pub const WEB_MERCATOR: u32 = 3857;

/// A reference ellipsoid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ellipsoid {
    pub name: &'static str,
    /// Semi-major axis in metres.
    pub a: f64,
    /// Inverse flattening.
    pub inv_f: f64,
}

impl Ellipsoid {
    pub const WGS84: Ellipsoid = Ellipsoid {
        name: "WGS 84",
        a: 6_378_137.0,
        inv_f: 298.257_223_563,
    };
    pub const GRS80: Ellipsoid = Ellipsoid {
        name: "GRS 1980",
        a: 6_378_137.0,
        inv_f: 298.257_222_101,
    };
    pub const CLARKE_1866: Ellipsoid = Ellipsoid {
        name: "Clarke 1866",
        a: 6_378_206.4,
        inv_f: 294.978_698_213_898,
    };
    pub const INTERNATIONAL_1924: Ellipsoid = Ellipsoid {
        name: "International 1924",
        a: 6_378_388.0,
        inv_f: 297.0,
    };
    pub const AIRY_1830: Ellipsoid = Ellipsoid {
        name: "Airy 1830",
        a: 6_377_563.396,
        inv_f: 299.324_964_6,
    };
    pub const BESSEL_1841: Ellipsoid = Ellipsoid {
        name: "Bessel 1841",
        a: 6_377_397.155,
        inv_f: 299.152_812_8,
    };

    /// Flattening.
    pub fn f(&self) -> f64 {
        1.0 / self.inv_f
    }

    /// Semi-minor axis in metres.
    pub fn b(&self) -> f64 {
        self.a * (1.0 - self.f())
    }

    /// First eccentricity squared.
    pub fn e2(&self) -> f64 {
        let f = self.f();
        f * (2.0 - f)
    }
}

/// Seven-parameter similarity transform to WGS 84 (position-vector convention).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HelmertParams {
    /// Translations in metres.
    pub tx: f64,
    pub ty: f64,
    pub tz: f64,
    /// Rotations in arc-seconds.
    pub rx: f64,
    pub ry: f64,
    pub rz: f64,
    /// Scale difference in parts per million.
    pub scale_ppm: f64,
    /// Published accuracy of the parameter set in metres.
    pub accuracy_m: f64,
}

/// Three-parameter geocentric translation to WGS 84.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MolodenskyParams {
    pub dx: f64,
    pub dy: f64,
    pub dz: f64,
    pub accuracy_m: f64,
}

/// How a datum relates to WGS 84.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DatumShift {
    /// The datum is WGS 84.
    Wgs84,
    /// Treated as coincident with WGS 84 within the stated accuracy.
    Equivalent { accuracy_m: f64 },
    Helmert(HelmertParams),
    Molodensky(MolodenskyParams),
    /// No published relation; only grid shifts can connect this datum.
    Unknown,
}

/// Transverse Mercator parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransverseMercatorParams {
    /// Latitude of origin in degrees.
    pub lat0: f64,
    /// Central meridian in degrees.
    pub lon0: f64,
    pub k0: f64,
    pub false_easting: f64,
    pub false_northing: f64,
}

impl TransverseMercatorParams {
    /// Parameters for a UTM zone.
    pub fn utm(zone: u32, south: bool) -> Self {
        Self {
            lat0: 0.0,
            lon0: -183.0 + 6.0 * zone as f64,
            k0: 0.9996,
            false_easting: 500_000.0,
            false_northing: if south { 10_000_000.0 } else { 0.0 },
        }
    }
}

/// Projection method applied on top of the geographic system.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Projection {
    Geographic,
    /// Spherical Mercator on the ellipsoid's semi-major axis.
    WebMercator,
    TransverseMercator(TransverseMercatorParams),
}

/// A coordinate reference system definition.
#[derive(Debug, Clone, PartialEq)]
pub struct Crs {
    pub code: u32,
    pub name: String,
    pub ellipsoid: Ellipsoid,
    pub datum: DatumShift,
    pub projection: Projection,
    /// Code of the geographic system the projection is based on.
    pub base_geographic: u32,
}

impl Crs {
    pub fn is_geographic(&self) -> bool {
        matches!(self.projection, Projection::Geographic)
    }

    fn geographic(code: u32, name: &str, ellipsoid: Ellipsoid, datum: DatumShift) -> Self {
        Self {
            code,
            name: name.to_string(),
            ellipsoid,
            datum,
            projection: Projection::Geographic,
            base_geographic: code,
        }
    }

    fn projected(code: u32, name: String, base: &Crs, projection: Projection) -> Self {
        Self {
            code,
            name,
            ellipsoid: base.ellipsoid,
            datum: base.datum,
            projection,
            base_geographic: base.code,
        }
    }
}

/// Read-only CRS dictionary.
///
/// Implementations must be cheap to share across threads; the engine calls
/// `lookup` at most once per code.
pub trait CrsLookup: Send + Sync {
    fn lookup(&self, code: u32) -> Option<Crs>;
}

/// Dictionary of commonly used systems.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinCrsDictionary;

impl BuiltinCrsDictionary {
    pub fn new() -> Self {
        Self
    }

    fn geographic(code: u32) -> Option<Crs> {
        let crs = match code {
            4326 => Crs::geographic(4326, "WGS 84", Ellipsoid::WGS84, DatumShift::Wgs84),
            4258 => Crs::geographic(
                4258,
                "ETRS89",
                Ellipsoid::GRS80,
                DatumShift::Equivalent { accuracy_m: 1.0 },
            ),
            4269 => Crs::geographic(
                4269,
                "NAD83",
                Ellipsoid::GRS80,
                DatumShift::Equivalent { accuracy_m: 2.0 },
            ),
            4267 => Crs::geographic(
                4267,
                "NAD27",
                Ellipsoid::CLARKE_1866,
                DatumShift::Molodensky(MolodenskyParams {
                    dx: -8.0,
                    dy: 160.0,
                    dz: 176.0,
                    accuracy_m: 10.0,
                }),
            ),
            4230 => Crs::geographic(
                4230,
                "ED50",
                Ellipsoid::INTERNATIONAL_1924,
                DatumShift::Molodensky(MolodenskyParams {
                    dx: -87.0,
                    dy: -98.0,
                    dz: -121.0,
                    accuracy_m: 10.0,
                }),
            ),
            4277 => Crs::geographic(
                4277,
                "OSGB36",
                Ellipsoid::AIRY_1830,
                DatumShift::Helmert(HelmertParams {
                    tx: 446.448,
                    ty: -125.157,
                    tz: 542.060,
                    rx: 0.1502,
                    ry: 0.2470,
                    rz: 0.8421,
                    scale_ppm: -20.4894,
                    accuracy_m: 2.0,
                }),
            ),
            4818 => Crs::geographic(4818, "S-JTSK (Ferro)", Ellipsoid::BESSEL_1841, DatumShift::Unknown),
            _ => return None,
        };
        Some(crs)
    }
}

impl CrsLookup for BuiltinCrsDictionary {
    fn lookup(&self, code: u32) -> Option<Crs> {
        if let Some(crs) = Self::geographic(code) {
            return Some(crs);
        }

        match code {
            3857 => {
                let base = Self::geographic(WGS84)?;
                Some(Crs::projected(
                    3857,
                    "WGS 84 / Pseudo-Mercator".to_string(),
                    &base,
                    Projection::WebMercator,
                ))
            }
            27700 => {
                let base = Self::geographic(4277)?;
                Some(Crs::projected(
                    27700,
                    "OSGB36 / British National Grid".to_string(),
                    &base,
                    Projection::TransverseMercator(TransverseMercatorParams {
                        lat0: 49.0,
                        lon0: -2.0,
                        k0: 0.999_601_271_7,
                        false_easting: 400_000.0,
                        false_northing: -100_000.0,
                    }),
                ))
            }
            32601..=32660 | 32701..=32760 => {
                let south = code > 32700;
                let zone = code % 100;
                let base = Self::geographic(WGS84)?;
                Some(Crs::projected(
                    code,
                    format!("WGS 84 / UTM zone {}{}", zone, if south { 'S' } else { 'N' }),
                    &base,
                    Projection::TransverseMercator(TransverseMercatorParams::utm(zone, south)),
                ))
            }
            25828..=25838 => {
                let zone = code % 100;
                let base = Self::geographic(4258)?;
                Some(Crs::projected(
                    code,
                    format!("ETRS89 / UTM zone {}N", zone),
                    &base,
                    Projection::TransverseMercator(TransverseMercatorParams::utm(zone, false)),
                ))
            }
            _ => None,
        }
    }
}
