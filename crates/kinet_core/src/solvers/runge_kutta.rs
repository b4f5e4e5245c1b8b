//! Explicit embedded Runge-Kutta pairs driven by a Butcher tableau.

use super::{ErrorNorm, StepEstimate, Stepper, Tolerances};
use crate::error::SimResult;
use crate::traits::DifferentialSystem;

/// Coefficients of an explicit embedded pair.
#[derive(Debug)]
pub struct Tableau {
    pub name: &'static str,
    pub c: &'static [f64],
    /// Row `s` holds the `s` coefficients of stage `s`.
    pub a: &'static [&'static [f64]],
    /// Weights of the propagated solution.
    pub b: &'static [f64],
    /// Weights of the error estimate (difference of the two solutions).
    pub e: &'static [f64],
    /// Secondary third-order estimator of the 8(5,3) scheme.
    pub e3: Option<&'static [f64]>,
    /// Order the error estimate scales with, minus one.
    pub error_order: usize,
}

impl Tableau {
    pub fn stages(&self) -> usize {
        self.c.len()
    }
}

pub static FEHLBERG45: Tableau = Tableau {
    name: "rkf45",
    c: &[0.0, 0.25, 0.375, 12.0 / 13.0, 1.0, 0.5],
    a: &[
        &[],
        &[0.25],
        &[3.0 / 32.0, 9.0 / 32.0],
        &[1932.0 / 2197.0, -7200.0 / 2197.0, 7296.0 / 2197.0],
        &[439.0 / 216.0, -8.0, 3680.0 / 513.0, -845.0 / 4104.0],
        &[-8.0 / 27.0, 2.0, -3544.0 / 2565.0, 1859.0 / 4104.0, -11.0 / 40.0],
    ],
    b: &[25.0 / 216.0, 0.0, 1408.0 / 2565.0, 2197.0 / 4104.0, -0.2, 0.0],
    e: &[
        1.0 / 360.0,
        0.0,
        -128.0 / 4275.0,
        -2197.0 / 75240.0,
        1.0 / 50.0,
        2.0 / 55.0,
    ],
    e3: None,
    error_order: 5,
};

pub static DORMAND_PRINCE54: Tableau = Tableau {
    name: "dopri5",
    c: &[0.0, 0.2, 0.3, 0.8, 8.0 / 9.0, 1.0, 1.0],
    a: &[
        &[],
        &[0.2],
        &[3.0 / 40.0, 9.0 / 40.0],
        &[44.0 / 45.0, -56.0 / 15.0, 32.0 / 9.0],
        &[
            19372.0 / 6561.0,
            -25360.0 / 2187.0,
            64448.0 / 6561.0,
            -212.0 / 729.0,
        ],
        &[
            9017.0 / 3168.0,
            -355.0 / 33.0,
            46732.0 / 5247.0,
            49.0 / 176.0,
            -5103.0 / 18656.0,
        ],
        &[
            35.0 / 384.0,
            0.0,
            500.0 / 1113.0,
            125.0 / 192.0,
            -2187.0 / 6784.0,
            11.0 / 84.0,
        ],
    ],
    b: &[
        35.0 / 384.0,
        0.0,
        500.0 / 1113.0,
        125.0 / 192.0,
        -2187.0 / 6784.0,
        11.0 / 84.0,
        0.0,
    ],
    e: &[
        71.0 / 57600.0,
        0.0,
        -71.0 / 16695.0,
        71.0 / 1920.0,
        -17253.0 / 339200.0,
        22.0 / 525.0,
        -1.0 / 40.0,
    ],
    e3: None,
    error_order: 5,
};

const DOP853_B: [f64; 12] = [
    5.42937341165687622380535766363e-2,
    0.0,
    0.0,
    0.0,
    0.0,
    4.45031289275240888144113950566,
    1.89151789931450038304281599044,
    -5.8012039600105847814672114227,
    3.1116436695781989440891606237e-1,
    -1.52160949662516078556178806805e-1,
    2.01365400804030348374776537501e-1,
    4.47106157277725905176885569043e-2,
];

pub static DORMAND_PRINCE853: Tableau = Tableau {
    name: "dop853",
    c: &[
        0.0,
        0.526001519587677318785587544488e-1,
        0.789002279381515978178381316732e-1,
        0.118350341907227396726757197510,
        0.281649658092772603273242802490,
        0.333333333333333333333333333333,
        0.25,
        0.307692307692307692307692307692,
        0.651282051282051282051282051282,
        0.6,
        0.857142857142857142857142857142,
        1.0,
    ],
    a: &[
        &[],
        &[5.26001519587677318785587544488e-2],
        &[
            1.97250569845378994544595329183e-2,
            5.91751709536136983633785987549e-2,
        ],
        &[
            2.95875854768068491816892993775e-2,
            0.0,
            8.87627564304205475450678981324e-2,
        ],
        &[
            2.41365134159266685502369798665e-1,
            0.0,
            -8.84549479328286085344864962717e-1,
            9.24834003261792003115737966543e-1,
        ],
        &[
            3.7037037037037037037037037037e-2,
            0.0,
            0.0,
            1.70828608729473871279604482173e-1,
            1.25467687566822425016691814123e-1,
        ],
        &[
            3.7109375e-2,
            0.0,
            0.0,
            1.70252211019544039314978060272e-1,
            6.02165389804559606850219397283e-2,
            -1.7578125e-2,
        ],
        &[
            3.70920001185047927108779319836e-2,
            0.0,
            0.0,
            1.70383925712239993810214054705e-1,
            1.07262030446373284651809199168e-1,
            -1.53194377486244017527936158236e-2,
            8.27378916381402288758473766002e-3,
        ],
        &[
            6.24110958716075717114429577812e-1,
            0.0,
            0.0,
            -3.36089262944694129406857109825,
            -8.68219346841726006818189891453e-1,
            2.75920996994467083049415600797e1,
            2.01540675504778934086186788979e1,
            -4.34898841810699588477366255144e1,
        ],
        &[
            4.77662536438264365890433908527e-1,
            0.0,
            0.0,
            -2.48811461997166764192642586468,
            -5.90290826836842996371446475743e-1,
            2.12300514481811942347288949897e1,
            1.52792336328824235832596922938e1,
            -3.32882109689848629194453265587e1,
            -2.03312017085086261358222928593e-2,
        ],
        &[
            -9.3714243008598732571704021658e-1,
            0.0,
            0.0,
            5.18637242884406370830023853209,
            1.09143734899672957818500254654,
            -8.14978701074692612513997267357,
            -1.85200656599969598641566180701e1,
            2.27394870993505042818970056734e1,
            2.49360555267965238987089396762,
            -3.0467644718982195003823669022,
        ],
        &[
            2.27331014751653820792359768449,
            0.0,
            0.0,
            -1.05344954667372501984066689879e1,
            -2.00087205822486249909675718444,
            -1.79589318631187989172765950534e1,
            2.79488845294199600508499808837e1,
            -2.85899827713502369474065508674,
            -8.87285693353062954433549289258,
            1.23605671757943030647266201528e1,
            6.43392746015763530355970484046e-1,
        ],
    ],
    b: &DOP853_B,
    e: &[
        0.1312004499419488073250102996e-1,
        0.0,
        0.0,
        0.0,
        0.0,
        -0.1225156446376204440720569753e1,
        -0.4957589496572501915214079952,
        0.1664377182454986536961530415e1,
        -0.3503288487499736816886487290,
        0.3341791187130174790297318841,
        0.8192320648511571246570742613e-1,
        -0.2235530786388629525884427845e-1,
    ],
    e3: Some(&[
        DOP853_B[0] - 0.244094488188976377952755905512,
        0.0,
        0.0,
        0.0,
        0.0,
        DOP853_B[5],
        DOP853_B[6],
        DOP853_B[7],
        DOP853_B[8] - 0.733846688281611857341361741547,
        DOP853_B[9],
        DOP853_B[10],
        DOP853_B[11] - 0.220588235294117647058823529412e-1,
    ]),
    error_order: 8,
};

/// Explicit embedded pair with RMS error control.
#[derive(Debug, Clone)]
pub struct EmbeddedRungeKutta {
    tableau: &'static Tableau,
    k: Vec<Vec<f64>>,
    tmp: Vec<f64>,
    err: Vec<f64>,
}

impl EmbeddedRungeKutta {
    pub fn new(tableau: &'static Tableau, dim: usize) -> Self {
        Self {
            tableau,
            k: vec![vec![0.0; dim]; tableau.stages()],
            tmp: vec![0.0; dim],
            err: vec![0.0; dim],
        }
    }

    pub fn fehlberg45(dim: usize) -> Self {
        Self::new(&FEHLBERG45, dim)
    }

    pub fn dormand_prince54(dim: usize) -> Self {
        Self::new(&DORMAND_PRINCE54, dim)
    }

    pub fn dormand_prince853(dim: usize) -> Self {
        Self::new(&DORMAND_PRINCE853, dim)
    }

    pub fn tableau(&self) -> &'static Tableau {
        self.tableau
    }

    fn weighted_sum(&self, weights: &[f64], i: usize) -> f64 {
        weights
            .iter()
            .zip(&self.k)
            .filter(|(w, _)| **w != 0.0)
            .map(|(w, k)| w * k[i])
            .sum()
    }

    /// Combined 5th/3rd order estimate of the 8(5,3) scheme.
    fn dop853_norm(&self, e3: &[f64], h: f64, y: &[f64], y_new: &[f64], tol: &Tolerances) -> f64 {
        let (mut e5_sq, mut e3_sq) = (0.0, 0.0);
        for i in 0..y.len() {
            let scale = tol.scale(i, y[i], y_new[i]);
            let e5 = self.weighted_sum(self.tableau.e, i) / scale;
            let e3 = self.weighted_sum(e3, i) / scale;
            e5_sq += e5 * e5;
            e3_sq += e3 * e3;
        }
        let denom = e5_sq + 0.01 * e3_sq;
        if denom <= 0.0 {
            return 0.0;
        }
        h.abs() * e5_sq / (denom * y.len() as f64).sqrt()
    }
}

impl Stepper for EmbeddedRungeKutta {
    fn name(&self) -> &'static str {
        self.tableau.name
    }

    fn attempt<S: DifferentialSystem + ?Sized>(
        &mut self,
        system: &mut S,
        t: f64,
        y: &[f64],
        h: f64,
        y_new: &mut [f64],
        tolerances: &Tolerances,
    ) -> SimResult<StepEstimate> {
        let tableau = self.tableau;
        let n = y.len();

        for s in 0..tableau.stages() {
            let row = tableau.a[s];
            for i in 0..n {
                let increment: f64 = row
                    .iter()
                    .zip(&self.k)
                    .map(|(a, k)| a * k[i])
                    .sum();
                self.tmp[i] = y[i] + h * increment;
            }
            system.compute_derivatives(t + tableau.c[s] * h, &self.tmp, &mut self.k[s])?;
        }

        for i in 0..n {
            y_new[i] = y[i] + h * self.weighted_sum(tableau.b, i);
        }

        let error = match tableau.e3 {
            Some(e3) => self.dop853_norm(e3, h, y, y_new, tolerances),
            None => {
                for i in 0..n {
                    self.err[i] = h * self.weighted_sum(tableau.e, i);
                }
                tolerances.norm(ErrorNorm::Rms, y, y_new, &self.err)
            }
        };
        Ok(StepEstimate::with_error(error, tableau.error_order))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solvers::test_systems::Decay;
    use approx::assert_abs_diff_eq;

    fn fixed_step_error(tableau: &'static Tableau, steps: usize) -> f64 {
        let mut stepper = EmbeddedRungeKutta::new(tableau, 1);
        let mut system = Decay {
            lambda: -1.0,
            y0: 1.0,
        };
        let tol = Tolerances::new(1e-12, 1e-12);
        let h = 1.0 / steps as f64;
        let mut y = vec![1.0];
        let mut y_new = vec![0.0];
        for n in 0..steps {
            stepper
                .attempt(&mut system, n as f64 * h, &y, h, &mut y_new, &tol)
                .unwrap();
            y.copy_from_slice(&y_new);
        }
        (y[0] - (-1.0f64).exp()).abs()
    }

    #[test]
    fn tableaus_are_consistent() {
        for tableau in [&FEHLBERG45, &DORMAND_PRINCE54, &DORMAND_PRINCE853] {
            for (s, row) in tableau.a.iter().enumerate() {
                assert_eq!(row.len(), s, "{} row {s}", tableau.name);
                assert_abs_diff_eq!(row.iter().sum::<f64>(), tableau.c[s], epsilon = 1e-12);
            }
            assert_abs_diff_eq!(tableau.b.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
            assert_abs_diff_eq!(tableau.e.iter().sum::<f64>(), 0.0, epsilon = 1e-12);
            if let Some(e3) = tableau.e3 {
                assert_abs_diff_eq!(e3.iter().sum::<f64>(), 0.0, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn dormand_prince_is_fifth_order() {
        let coarse = fixed_step_error(&DORMAND_PRINCE54, 10);
        let fine = fixed_step_error(&DORMAND_PRINCE54, 20);
        let ratio = coarse / fine;
        assert!(ratio > 25.0 && ratio < 45.0, "ratio {ratio}");
    }

    #[test]
    fn fehlberg_is_fourth_order() {
        let coarse = fixed_step_error(&FEHLBERG45, 10);
        let fine = fixed_step_error(&FEHLBERG45, 20);
        let ratio = coarse / fine;
        assert!(ratio > 12.0 && ratio < 24.0, "ratio {ratio}");
    }

    #[test]
    fn dop853_is_very_accurate() {
        assert!(fixed_step_error(&DORMAND_PRINCE853, 10) < 1e-11);
    }

    #[test]
    fn error_estimate_shrinks_with_step() {
        let tol = Tolerances::new(1e-6, 1e-6);
        let mut system = Decay {
            lambda: -1.0,
            y0: 1.0,
        };
        let mut y_new = vec![0.0];
        let mut stepper = EmbeddedRungeKutta::dormand_prince54(1);
        let big = stepper
            .attempt(&mut system, 0.0, &[1.0], 0.4, &mut y_new, &tol)
            .unwrap()
            .error
            .unwrap();
        let small = stepper
            .attempt(&mut system, 0.0, &[1.0], 0.2, &mut y_new, &tol)
            .unwrap()
            .error
            .unwrap();
        assert!(big / small > 20.0, "{big} vs {small}");
    }
}
