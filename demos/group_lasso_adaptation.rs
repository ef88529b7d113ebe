//! Class-aware domain adaptation with group-regularized couplings
//!
//! Three labeled source blobs and an unlabeled, rotated target domain. Plain
//! entropic OT, Lp-L1 and L1-L2 group-regularized OT are compared on how often a
//! transported source sample lands next to a target sample of its own class.
//!
//! Run: RUST_LOG=debug cargo run --example group_lasso_adaptation

use ndarray::Array2;
use otda::adapt::{AdaptConfig, CouplingMethod, DomainTransport};
use otda::cost::CostNormalization;
use otda::group::GroupConfig;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

const CENTERS: [[f64; 2]; 3] = [[0.0, 0.0], [3.0, 0.0], [1.5, 2.5]];

/// Labeled blobs around `CENTERS`, rotated by `angle` radians.
fn blobs(per_class: usize, angle: f64, spread: f64, rng: &mut ChaCha8Rng) -> (Array2<f64>, Vec<i64>) {
    let noise = Normal::new(0.0, spread).unwrap();
    let (sin, cos) = angle.sin_cos();
    let mut x = Array2::zeros((per_class * CENTERS.len(), 2));
    let mut labels = Vec::with_capacity(x.nrows());
    for (c, center) in CENTERS.iter().enumerate() {
        for k in 0..per_class {
            let i = c * per_class + k;
            let (px, py) = (center[0] + noise.sample(rng), center[1] + noise.sample(rng));
            x[[i, 0]] = cos * px - sin * py;
            x[[i, 1]] = sin * px + cos * py;
            labels.push(c as i64);
        }
    }
    (x, labels)
}

fn accuracy(moved: &Array2<f64>, ys: &[i64], xt: &Array2<f64>, yt: &[i64]) -> f64 {
    let hits = moved
        .outer_iter()
        .zip(ys)
        .filter(|(p, label)| {
            let nearest = xt
                .outer_iter()
                .map(|q| p.iter().zip(q.iter()).map(|(a, b)| (a - b) * (a - b)).sum::<f64>())
                .enumerate()
                .fold((0, f64::INFINITY), |best, (j, d)| if d < best.1 { (j, d) } else { best });
            yt[nearest.0] == **label
        })
        .count();
    hits as f64 / ys.len() as f64
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let (xs, ys) = blobs(20, 0.0, 0.6, &mut rng);
    // Target labels are only used to score the result.
    let (xt, yt) = blobs(20, 0.5, 0.6, &mut rng);

    let cfg = AdaptConfig {
        normalization: Some(CostNormalization::Median),
        ..AdaptConfig::default()
    };
    let group = GroupConfig {
        eta: 1.0,
        inner_max_iter: 1000,
        verbose: true,
        ..GroupConfig::default()
    };
    let methods = [
        ("sinkhorn", CouplingMethod::Sinkhorn { reg: 0.5 }),
        (
            "lp-l1",
            CouplingMethod::Lpl1 {
                reg: 0.5,
                config: group.clone(),
            },
        ),
        (
            "l1-l2",
            CouplingMethod::L1l2 {
                reg: 0.5,
                config: group,
            },
        ),
    ];

    println!("{:>10} | {:>8}", "method", "accuracy");
    println!("{}", "-".repeat(21));
    for (name, method) in &methods {
        let da = DomainTransport::fit(&xs, Some(&ys[..]), &xt, None, method, &cfg)?;
        let acc = accuracy(&da.transform(), &ys, &xt, &yt);
        println!("{:>10} | {:>8.3}", name, acc);
    }

    Ok(())
}
