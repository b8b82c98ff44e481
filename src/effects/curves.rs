//! 1-D lookup curves for the luma mapping effects.
//!
//! Each curve is a 256x1 RGBA8 table indexed by `luma * 256`.

/// Number of entries in a curve table.
pub const CURVE_LEN: u32 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Curve {
    /// Thermal camera look: black through purple, red and yellow to white.
    Heat,
    /// Cross-processed film: contrasty red, lifted blue shadows.
    Cross,
    Sepia,
}

const HEAT_STOPS: &[(f32, [f32; 3])] = &[
    (0.0, [0.0, 0.0, 0.0]),
    (0.25, [0.5, 0.0, 0.6]),
    (0.5, [1.0, 0.0, 0.0]),
    (0.75, [1.0, 0.6, 0.0]),
    (0.9, [1.0, 1.0, 0.0]),
    (1.0, [1.0, 1.0, 1.0]),
];

const SEPIA_STOPS: &[(f32, [f32; 3])] = &[
    (0.0, [0.0, 0.0, 0.0]),
    (0.4, [0.44, 0.30, 0.16]),
    (0.75, [0.80, 0.66, 0.46]),
    (1.0, [1.0, 0.96, 0.86]),
];

impl Curve {
    /// RGBA8 texels of the table, `CURVE_LEN * 4` bytes.
    pub fn table(self) -> Vec<u8> {
        (0..CURVE_LEN)
            .flat_map(|i| {
                let x = i as f32 / (CURVE_LEN - 1) as f32;
                let [r, g, b] = self.eval(x);
                [to_u8(r), to_u8(g), to_u8(b), 255]
            })
            .collect()
    }

    /// Curve color at luma `x` in `[0, 1]`.
    pub fn eval(self, x: f32) -> [f32; 3] {
        match self {
            Curve::Heat => gradient(HEAT_STOPS, x),
            Curve::Sepia => gradient(SEPIA_STOPS, x),
            Curve::Cross => {
                let s = x * x * (3.0 - 2.0 * x);
                [
                    s * 1.1 - 0.05,
                    x.powf(0.9),
                    0.15 + 0.7 * x,
                ]
            }
        }
    }
}

fn gradient(stops: &[(f32, [f32; 3])], x: f32) -> [f32; 3] {
    let x = x.clamp(0.0, 1.0);
    for pair in stops.windows(2) {
        let (x0, c0) = pair[0];
        let (x1, c1) = pair[1];
        if x <= x1 {
            let t = if x1 > x0 { (x - x0) / (x1 - x0) } else { 0.0 };
            return [
                c0[0] + (c1[0] - c0[0]) * t,
                c0[1] + (c1[1] - c0[1]) * t,
                c0[2] + (c1[2] - c0[2]) * t,
            ];
        }
    }
    stops.last().map(|(_, c)| *c).unwrap_or([0.0; 3])
}

fn to_u8(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_size() {
        for curve in [Curve::Heat, Curve::Cross, Curve::Sepia] {
            let table = curve.table();
            assert_eq!(table.len(), CURVE_LEN as usize * 4);
            assert!(table.chunks(4).all(|t| t[3] == 255));
        }
    }

    #[test]
    fn test_heat_end_points() {
        let table = Curve::Heat.table();
        assert_eq!(&table[..4], &[0, 0, 0, 255]);
        assert_eq!(&table[table.len() - 4..], &[255, 255, 255, 255]);
        assert_eq!(Curve::Heat.eval(0.5), [1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_sepia_is_warm() {
        let [r, g, b] = Curve::Sepia.eval(0.5);
        assert!(r > g && g > b);
    }
}
