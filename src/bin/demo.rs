use arbora::{
    Result, Vert3d,
    comm::SerialComm,
    forest::{Forest, TensorForest},
    functional::{CurvatureConstraint, CurvatureOptions},
    init_log,
    recon::compute_recon_solution_3d,
};
use log::info;

fn main() -> Result<()> {
    init_log("debug");

    let comm = SerialComm::new();

    // Reconstruct a smooth field on an order-elevated mesh
    let forest = TensorForest::<3>::unit_box([4, 4, 4], 2);
    let refined = forest.elevated();

    let f = |p: &Vert3d| (2.5 * p[0]).sin() * (1.5 * p[1]).cos() + p[2] * p[2];
    let mut u = forest.create_vec(1);
    for (i, p) in forest.points().iter().enumerate() {
        u.as_mut_slice()[i] = f(p);
    }

    let mut u_refined = refined.create_vec(1);
    compute_recon_solution_3d(&forest, &refined, &mut u, &mut u_refined, false)?;

    let max_err = refined
        .points()
        .iter()
        .zip(u_refined.as_slice().iter())
        .map(|(p, v)| (v - f(p)).abs())
        .fold(0.0, f64::max)
        / u_refined
            .as_slice()
            .iter()
            .fold(0.0f64, |m, v| m.max(v.abs()));
    info!("Relative reconstruction deviation at the refined nodes: {max_err:.3e}");

    // Curvature of a spherical design transition band
    let design_forest = TensorForest::<3>::boxed(
        Vert3d::new(-1.5, -1.5, -1.5),
        [3.0, 3.0, 3.0],
        [8, 8, 8],
        2,
    );
    let mut x = design_forest.create_vec(1);
    for (i, p) in design_forest.points().iter().enumerate() {
        x.as_mut_slice()[i] = 1.0 - 0.5 * p.norm();
    }

    let mut con = CurvatureConstraint::new(&design_forest, CurvatureOptions::default());
    let val = con.eval_constraint(&comm, &x)?;
    info!("Aggregated curvature of the spherical band: {val:.6e}");

    con.write_curvature_vtk(&comm, &x, "curvature.vtk")?;
    info!("Curvature field written to curvature.vtk");

    Ok(())
}
