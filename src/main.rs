//! splatsurf command line driver
//!
//! Usage: splatsurf [OPTIONS] <input.ply>...
//!
//! Options:
//!   --fit-smooth <F>   Smoothing factor applied to splat radii (default: 4.0)
//!   --fit-grid <F>     Grid cell spacing (default: 0.01)
//!   --prune <F>        Component prune threshold in [0, 1] (default: 0)
//!   --low-power        Prefer a low-power adapter
//!   --quiet            Only show warnings and errors
//!
//! Loads the splats, fits the reconstruction grid and builds the device
//! octree, reporting timings and the estimated device memory. Surface
//! extraction plugs in through `pipeline::reconstruct` with a marching
//! stage implementation.

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::time::Instant;

use splatsurf::core::config::Config;
use splatsurf::core::stats;
use splatsurf::core::types::Result;
use splatsurf::gpu::{timing, GpuContext};
use splatsurf::grid::Grid;
use splatsurf::pipeline;
use splatsurf::ply::PlyReader;
use splatsurf::tree::{self, SplatOctree};

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "-h" || a == "--help") || args.len() < 2 {
        print_usage();
        return;
    }

    let config = Config {
        fit_smooth: parse_f32_arg(&args, "--fit-smooth").unwrap_or(4.0),
        fit_grid: parse_f32_arg(&args, "--fit-grid").unwrap_or(0.01),
        prune_threshold: parse_f32_arg(&args, "--prune").unwrap_or(0.0) as f64,
        output: None,
        low_power: args.iter().any(|a| a == "--low-power"),
        quiet: args.iter().any(|a| a == "--quiet"),
    };

    env_logger::Builder::from_env(
        env_logger::Env::default()
            .default_filter_or(if config.quiet { "warn" } else { "info" }),
    )
    .init();

    let inputs = positional_args(&args);
    if inputs.is_empty() {
        eprintln!("no input files");
        std::process::exit(1);
    }

    if let Err(e) = run(&config, &inputs) {
        eprintln!("{e}");
        std::process::exit(1);
    }
}

fn run(config: &Config, inputs: &[PathBuf]) -> Result<()> {
    let mut readers = Vec::with_capacity(inputs.len());
    for path in inputs {
        let name = path.display().to_string();
        let file = BufReader::new(File::open(path)?);
        readers.push(PlyReader::new(file, &name)?);
    }

    let load_start = Instant::now();
    let splats = pipeline::load_splats(readers, config.fit_smooth, 64 << 20)?;
    log::info!(
        "Loaded {} splats in {:.3}s",
        splats.len(),
        load_start.elapsed().as_secs_f64()
    );

    if splats.len() > tree::MAX_SPLATS {
        return Err(splatsurf::core::Error::ResourceExhausted(format!(
            "{} splats exceed the supported maximum of {}",
            splats.len(),
            tree::MAX_SPLATS
        )));
    }

    let mut grid = Grid::fit(&splats, config.fit_grid)?;
    let dims = grid.round_extents(pipeline::MARCH_WORKGROUP);
    log::info!("Octree cells: {} x {} x {}", dims[0], dims[1], dims[2]);

    let ctx = GpuContext::new_blocking(config.power_preference())?;
    tree::validate_device(&ctx.adapter)?;

    let retained = dims.map(|d| d.div_ceil(1 << pipeline::SUBSAMPLING_SHIFT).max(1));
    let levels = tree::level_count(retained);
    if levels > tree::MAX_LEVELS {
        return Err(splatsurf::core::Error::ResourceExhausted(format!(
            "grid needs {} octree levels, the maximum is {}; increase --fit-grid",
            levels,
            tree::MAX_LEVELS
        )));
    }
    let usage = tree::resource_usage(levels, splats.len());
    usage.check(&ctx.adapter)?;
    log::info!(
        "Estimated octree device memory: {} MiB ({} levels)",
        usage.total_bytes >> 20,
        levels
    );

    let splat_buffer = ctx.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("input_splats"),
        size: std::mem::size_of_val(splats.as_slice()) as u64,
        usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    ctx.queue
        .write_buffer(&splat_buffer, 0, bytemuck::cast_slice(&splats));

    let mut octree = SplatOctree::new(&ctx.device, levels, splats.len())?;
    let build_start = Instant::now();
    let build = octree.enqueue_build(
        &ctx.queue,
        &splat_buffer,
        0,
        splats.len(),
        dims,
        [0, 0, 0],
        &grid,
        pipeline::SUBSAMPLING_SHIFT,
    );
    build.wait();
    log::info!("Build: {:.3}s", build_start.elapsed().as_secs_f64());

    timing::flush(true);
    for (name, variable) in stats::global().variables_snapshot() {
        log::info!(
            "{}: {} samples, {:.4}s total",
            name,
            variable.count,
            variable.total
        );
    }
    let peak = stats::global().peak("mem.all");
    log::info!("Peak arena memory: {} bytes", peak.peak);

    Ok(())
}

fn print_usage() {
    println!(
        "Usage: splatsurf [OPTIONS] <input.ply>...\n\
         \n\
         Options:\n\
         \x20 --fit-smooth <F>   smoothing factor (default: 4.0)\n\
         \x20 --fit-grid <F>     spacing of grid cells (default: 0.01)\n\
         \x20 --prune <F>        component prune threshold (default: 0)\n\
         \x20 --low-power        prefer a low-power adapter\n\
         \x20 --quiet            do not show informational messages"
    );
}

fn parse_f32_arg(args: &[String], name: &str) -> Option<f32> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .and_then(|v| v.parse().ok())
}

fn positional_args(args: &[String]) -> Vec<PathBuf> {
    let mut inputs = Vec::new();
    let mut skip = false;
    for arg in &args[1..] {
        if skip {
            skip = false;
            continue;
        }
        match arg.as_str() {
            "--fit-smooth" | "--fit-grid" | "--prune" => skip = true,
            "--low-power" | "--quiet" => {}
            other => inputs.push(PathBuf::from(other)),
        }
    }
    inputs
}
