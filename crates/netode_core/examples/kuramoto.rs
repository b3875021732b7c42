//! Two forced phase oscillators locking through a strong coupling.
//!
//! Run with `cargo run -p netode_core --example kuramoto`.

use netode_core::{
    attrs, Context, IntegrateOptions, NetworkSpec, Protocol, RhsKey, Terms, Undirected,
};
use std::f64::consts::PI;

fn kuramoto() -> Protocol<u32, Undirected> {
    Protocol::monolithic(|ctx: &Context<'_, u32, Undirected>| {
        let x = ctx.state();
        let w = ctx.node_param("w")?;
        let mut rhs = Vec::new();
        for u in ctx.nodes() {
            let mut dudt = (w.at(u)? * ctx.t()).sin();
            for v in ctx.graph().neighbors(u)? {
                dudt += ctx.a(u, v) * (x.at(v)? - x.at(u)?).sin();
            }
            rhs.push((RhsKey::Node(*u), Terms::from(dudt)));
        }
        Ok(rhs)
    })
}

fn main() -> anyhow::Result<()> {
    let mut net = NetworkSpec::new(kuramoto()).node_params(["w"]).build()?;
    net.add_node(0, attrs([("w", 2.0 * PI + 0.1)]));
    net.add_node(1, attrs([("w", 2.0 * PI - 0.1)]));
    net.add_edge(0, 1, attrs([("weight", 10.0)]));

    let system = net.system()?;
    for (dep, expr) in system.dependencies().iter().zip(system.expressions()) {
        println!("d{dep}/dt = {expr}");
    }

    let options = IntegrateOptions {
        dt: 1e-3,
        ..Default::default()
    };
    let samples: Vec<f64> = (0..=30).map(|i| f64::from(i) * 0.1).collect();
    let res = net.integrate(samples, &[0.5, 4.0], &options)?;

    println!("t,x_0,x_1");
    for (t, y) in res.xout.iter().zip(&res.yout) {
        println!("{t:.3},{:.6},{:.6}", y[0], y[1]);
    }
    Ok(())
}
