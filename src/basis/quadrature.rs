//! Gauss-Legendre quadrature on `[-1, 1]`

/// Points and weights of the `n`-point Gauss-Legendre rule
#[must_use]
pub fn gauss_rule(n: usize) -> (&'static [f64], &'static [f64]) {
    match n {
        1 => (&[0.0], &[2.0]),
        2 => (
            &[-0.577_350_269_189_625_8, 0.577_350_269_189_625_8],
            &[1.0, 1.0],
        ),
        3 => (
            &[-0.774_596_669_241_483_4, 0.0, 0.774_596_669_241_483_4],
            &[
                0.555_555_555_555_555_6,
                0.888_888_888_888_888_9,
                0.555_555_555_555_555_6,
            ],
        ),
        4 => (
            &[
                -0.861_136_311_594_052_6,
                -0.339_981_043_584_856_3,
                0.339_981_043_584_856_3,
                0.861_136_311_594_052_6,
            ],
            &[
                0.347_854_845_137_453_85,
                0.652_145_154_862_546_2,
                0.652_145_154_862_546_2,
                0.347_854_845_137_453_85,
            ],
        ),
        5 => (
            &[
                -0.906_179_845_938_664,
                -0.538_469_310_105_683,
                0.0,
                0.538_469_310_105_683,
                0.906_179_845_938_664,
            ],
            &[
                0.236_926_885_056_189_08,
                0.478_628_670_499_366_47,
                0.568_888_888_888_888_9,
                0.478_628_670_499_366_47,
                0.236_926_885_056_189_08,
            ],
        ),
        _ => unreachable!("unsupported Gauss rule with {n} points"),
    }
}
