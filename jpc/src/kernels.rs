// Wavelet kernel descriptors. The lifting arithmetic itself lives with the
// transform engine; the structure layer only needs supports and symmetry.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelId {
    /// Reversible 5/3 (integer lifting).
    W5X3,
    /// Irreversible 9/7 (floating point lifting).
    W9X7,
}

impl KernelId {
    // SPcod/SPcoc transformation byte, A.6.1 Table A.20
    pub(crate) fn from_marker(value: u8) -> Option<KernelId> {
        match value {
            0 => Some(KernelId::W9X7),
            1 => Some(KernelId::W5X3),
            _ => None,
        }
    }

    pub(crate) fn marker_value(self) -> u8 {
        match self {
            KernelId::W9X7 => 0,
            KernelId::W5X3 => 1,
        }
    }
}

/// One lifting step: `x[2n+1-parity] += sum(coefficients[k] * x[2(n+support_min+k)+parity])`.
#[derive(Debug, Clone, PartialEq)]
pub struct LiftingStep {
    pub support_min: i32,
    pub coefficients: Vec<f32>,
    /// Integer rounding offset and downshift, meaningful for reversible steps.
    pub rounding_offset: i32,
    pub downshift: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Kernel {
    pub id: KernelId,
    pub reversible: bool,
    pub symmetric: bool,
    pub steps: Vec<LiftingStep>,
    pub low_scale: f32,
    pub high_scale: f32,
}

impl Kernel {
    pub fn new(id: KernelId) -> Kernel {
        match id {
            KernelId::W5X3 => Kernel {
                id,
                reversible: true,
                symmetric: true,
                steps: vec![
                    LiftingStep {
                        support_min: 0,
                        coefficients: vec![-0.5, -0.5],
                        rounding_offset: 1,
                        downshift: 1,
                    },
                    LiftingStep {
                        support_min: -1,
                        coefficients: vec![0.25, 0.25],
                        rounding_offset: 2,
                        downshift: 2,
                    },
                ],
                low_scale: 1.0,
                high_scale: 1.0,
            },
            KernelId::W9X7 => {
                let alpha = -1.586_134_3_f32;
                let beta = -0.052_980_118_f32;
                let gamma = 0.882_911_1_f32;
                let delta = 0.443_506_87_f32;
                let k = 1.230_174_1_f32;
                Kernel {
                    id,
                    reversible: false,
                    symmetric: true,
                    steps: vec![
                        LiftingStep {
                            support_min: 0,
                            coefficients: vec![alpha, alpha],
                            rounding_offset: 0,
                            downshift: 0,
                        },
                        LiftingStep {
                            support_min: -1,
                            coefficients: vec![beta, beta],
                            rounding_offset: 0,
                            downshift: 0,
                        },
                        LiftingStep {
                            support_min: 0,
                            coefficients: vec![gamma, gamma],
                            rounding_offset: 0,
                            downshift: 0,
                        },
                        LiftingStep {
                            support_min: -1,
                            coefficients: vec![delta, delta],
                            rounding_offset: 0,
                            downshift: 0,
                        },
                    ],
                    low_scale: 1.0 / k,
                    high_scale: k / 2.0,
                }
            }
        }
    }

    /// Margin, in interleaved samples, by which a region must grow on each
    /// side to cover every low-pass coefficient that contributes to it.
    ///
    /// Each lifting step widens the footprint by its tap span; the low-pass
    /// branch accumulates every step, the high-pass all but the last.
    pub fn low_support(&self) -> i64 {
        self.steps
            .iter()
            .map(|step| step.coefficients.len() as i64)
            .sum()
    }

    pub fn high_support(&self) -> i64 {
        let last = self
            .steps
            .last()
            .map(|step| step.coefficients.len() as i64)
            .unwrap_or(0);
        (self.low_support() - last).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supports() {
        let w53 = Kernel::new(KernelId::W5X3);
        assert_eq!(w53.low_support(), 4);
        assert_eq!(w53.high_support(), 2);
        let w97 = Kernel::new(KernelId::W9X7);
        assert_eq!(w97.low_support(), 8);
        assert_eq!(w97.high_support(), 6);
        assert_eq!(KernelId::from_marker(w53.id.marker_value()), Some(KernelId::W5X3));
    }
}
