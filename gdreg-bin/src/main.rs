// SPDX-License-Identifier: MPL-2.0

mod volumes;

use anyhow::Context;
use std::path::{Path, PathBuf};

use gdreg::affine::{self, AffineConfig, AffineSeed};
use gdreg::brute;
use gdreg::chain::{self, ResliceInterp, TransformSpec};
use gdreg::deformable::{self, DeformableConfig, InitialSeed, IterationEvent};
use gdreg::img::Image;
use gdreg::io::{
    field_voxel_to_physical, read_affine_matrix, write_affine_matrix, VolumeSink, VolumeSource,
};
use gdreg::kernels::StepMode;
use gdreg::metric::MetricKind;
use gdreg::pyramid::{ImagePair, Pyramid};
use gdreg::utils::{parse_schedule, Sigma};
use volumes::FileVolumes;

// Default values for some of the program arguments.
const DEFAULT_DIM: &str = "3";
const DEFAULT_ITERATIONS: &str = "100x50";
const DEFAULT_METRIC: &str = "ssd";
const DEFAULT_MI_BINS: &str = "32";
const DEFAULT_SIGMA_PRE: &str = "1.7vox";
const DEFAULT_SIGMA_POST: &str = "0.6vox";
const DEFAULT_STEP: &str = "1.0";
const DEFAULT_STEP_MODE: &str = "scaledown";
const DEFAULT_NOISE: &str = "0.001";
const DEFAULT_WARP_PRECISION: &str = "0";
const DEFAULT_INVERSE_EXPONENT: &str = "2";
const DEFAULT_DERIV_EPS: &str = "1e-4";
const DEFAULT_DUMP_FREQ: &str = "10";
const DEFAULT_DUMP_DIR: &str = "dump";

const INVERSE_ITERATIONS: usize = 20;
const INVERSE_TOLERANCE: f64 = 1e-3;

/// Entry point of the program.
fn main() {
    if let Err(err) = try_main() {
        eprintln!("ABORTING: {:#}", err);
        std::process::exit(1);
    }
}

fn try_main() -> anyhow::Result<()> {
    // CLI arguments related to the core registration parameters.
    let core_args = vec![
        clap::Arg::with_name("dim")
            .long("dim")
            .short("d")
            .value_name("D")
            .default_value(DEFAULT_DIM)
            .help("Image dimensionality (2, 3 or 4)"),
        clap::Arg::with_name("input")
            .long("input")
            .short("i")
            .value_names(&["FIXED", "MOVING"])
            .number_of_values(2)
            .multiple(true)
            .help("Fixed and moving image pair (repeatable)"),
        clap::Arg::with_name("weight")
            .long("weight")
            .short("w")
            .value_name("W")
            .multiple(true)
            .number_of_values(1)
            .help("Relative weight of the matching input pair"),
        clap::Arg::with_name("metric")
            .long("metric")
            .short("m")
            .value_name("NAME")
            .default_value(DEFAULT_METRIC)
            .help("Similarity metric: ssd, ncc or mi"),
        clap::Arg::with_name("ncc-radius")
            .long("ncc-radius")
            .value_name("AxBx...")
            .help("Patch radius per axis for the NCC metric"),
        clap::Arg::with_name("mi-bins")
            .long("mi-bins")
            .value_name("N")
            .default_value(DEFAULT_MI_BINS)
            .help("Histogram bins per axis for the MI metric"),
        clap::Arg::with_name("iterations")
            .long("iterations")
            .short("n")
            .value_name("AxBx...")
            .default_value(DEFAULT_ITERATIONS)
            .help("Iterations per level, coarse to fine; also fixes the pyramid depth"),
        clap::Arg::with_name("sigma-pre")
            .long("sigma-pre")
            .value_name("S[vox|mm]")
            .default_value(DEFAULT_SIGMA_PRE)
            .help("Smoothing of the update field before composition"),
        clap::Arg::with_name("sigma-post")
            .long("sigma-post")
            .value_name("S[vox|mm]")
            .default_value(DEFAULT_SIGMA_POST)
            .help("Smoothing of the accumulated field after composition"),
        clap::Arg::with_name("step")
            .long("step")
            .short("e")
            .value_name("EPS")
            .default_value(DEFAULT_STEP)
            .help("Step size in voxel units"),
        clap::Arg::with_name("step-mode")
            .long("step-mode")
            .value_name("MODE")
            .default_value(DEFAULT_STEP_MODE)
            .help("Step policy: const, scale or scaledown"),
        clap::Arg::with_name("gradient-mask")
            .long("gradient-mask")
            .value_name("path")
            .help("Scalar weight applied to the metric gradient"),
        clap::Arg::with_name("initial-affine")
            .long("initial-affine")
            .value_name("path")
            .help("RAS affine matrix seeding the registration"),
        clap::Arg::with_name("initial-transform")
            .long("initial-transform")
            .value_name("SPEC")
            .multiple(true)
            .number_of_values(1)
            .help("Transform chain composed into the starting displacement"),
        clap::Arg::with_name("noise")
            .long("noise")
            .value_name("x")
            .default_value(DEFAULT_NOISE)
            .help("NCC stabilization noise, as a fraction of the intensity range"),
    ];
    // CLI arguments selecting and tuning the solver mode.
    let mode_args = vec![
        clap::Arg::with_name("affine")
            .long("affine")
            .short("a")
            .help("Optimize an affine transform instead of a deformable field"),
        clap::Arg::with_name("powell")
            .long("powell")
            .help("Use the derivative-free Powell minimizer for the affine mode"),
        clap::Arg::with_name("brute")
            .long("brute")
            .value_name("AxBx...")
            .help("Brute-force search radius per axis (NCC only)"),
        clap::Arg::with_name("debug-deriv")
            .long("debug-deriv")
            .help("Check the affine gradient against central differences"),
        clap::Arg::with_name("debug-deriv-eps")
            .long("debug-deriv-eps")
            .value_name("E")
            .default_value(DEFAULT_DERIV_EPS)
            .help("Step of the derivative check"),
    ];
    // CLI arguments related to outputs and the reslice mode.
    let io_args = vec![
        clap::Arg::with_name("verbose")
            .short("v")
            .multiple(true)
            .help("Multiple levels of verbosity (up to -vvv)"),
        clap::Arg::with_name("output")
            .long("output")
            .short("o")
            .value_name("path")
            .help("Output warp (deformable/brute) or matrix (affine)"),
        clap::Arg::with_name("output-inverse")
            .long("output-inverse")
            .value_name("path")
            .help("Also write the inverse of the computed warp"),
        clap::Arg::with_name("inverse-exponent")
            .long("inverse-exponent")
            .value_name("N")
            .default_value(DEFAULT_INVERSE_EXPONENT)
            .help("Square roots taken when the inverse iteration stalls"),
        clap::Arg::with_name("warp-precision")
            .long("warp-precision")
            .value_name("VOX")
            .default_value(DEFAULT_WARP_PRECISION)
            .help("Quantization of serialized warps, in voxels (0 disables)"),
        clap::Arg::with_name("threads")
            .long("threads")
            .value_name("N")
            .help("Worker thread budget (default: all cores)"),
        clap::Arg::with_name("dump-moving")
            .long("dump-moving")
            .help("Dump the warped moving image while iterating"),
        clap::Arg::with_name("dump-freq")
            .long("dump-freq")
            .value_name("N")
            .default_value(DEFAULT_DUMP_FREQ)
            .help("Iterations between dumps"),
        clap::Arg::with_name("dump-dir")
            .long("dump-dir")
            .value_name("path")
            .default_value(DEFAULT_DUMP_DIR)
            .help("Directory receiving the dumps"),
        clap::Arg::with_name("reslice")
            .long("reslice")
            .short("r")
            .value_name("SPEC")
            .multiple(true)
            .number_of_values(1)
            .help("Reslice mode: transform chain file[,exponent] (repeatable)"),
        clap::Arg::with_name("reslice-ref")
            .long("reslice-ref")
            .value_name("path")
            .help("Reference grid of the reslice mode"),
        clap::Arg::with_name("reslice-moving")
            .long("reslice-moving")
            .value_names(&["IN", "OUT"])
            .number_of_values(2)
            .multiple(true)
            .help("Image to reslice and its output path (repeatable)"),
        clap::Arg::with_name("reslice-interp")
            .long("reslice-interp")
            .value_name("MODE [SIGMA]")
            .min_values(1)
            .max_values(2)
            .help("Reslice interpolation: linear, nn, or label SIGMA[vox|mm]"),
    ];
    let matches = clap::App::new("gdreg")
        .version(std::env!("CARGO_PKG_VERSION"))
        .about("Greedy diffeomorphic and affine registration of N-dimensional images")
        .args(&core_args)
        .args(&mode_args)
        .args(&io_args)
        .get_matches();

    // Set log verbosity.
    let verbosity = 2 + matches.occurrences_of("verbose");
    stderrlog::new()
        .quiet(false)
        .verbosity(verbosity as usize)
        .show_level(false)
        .color(stderrlog::ColorChoice::Never)
        .init()
        .context("Failed to initialize log verbosity")?;

    let args = get_args(&matches)?;
    if let Some(n) = args.threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(n)
            .build_global()
            .context("Failed to size the worker pool")?;
    }
    run(args)
}

#[derive(Debug)]
enum Mode {
    Deformable,
    Affine,
    Brute(Vec<usize>),
    Reslice,
}

#[derive(Debug)]
/// Type holding command line arguments.
struct Args {
    dim: usize,
    mode: Mode,
    pairs: Vec<(PathBuf, PathBuf)>,
    weights: Vec<f32>,
    metric: MetricKind,
    iterations: Vec<usize>,
    sigma_pre: Sigma,
    sigma_post: Sigma,
    step: f64,
    step_mode: StepMode,
    gradient_mask: Option<PathBuf>,
    initial_affine: Option<PathBuf>,
    initial_transforms: Vec<TransformSpec>,
    noise: f64,
    use_powell: bool,
    debug_deriv: Option<f64>,
    output: Option<PathBuf>,
    output_inverse: Option<PathBuf>,
    inverse_exponent: u32,
    warp_precision: f64,
    threads: Option<usize>,
    dump_moving: bool,
    dump_freq: usize,
    dump_dir: PathBuf,
    reslice: Vec<TransformSpec>,
    reslice_ref: Option<PathBuf>,
    reslice_moving: Vec<(PathBuf, PathBuf)>,
    reslice_interp: ResliceInterp,
}

fn path_pairs(values: Option<clap::Values>) -> Vec<(PathBuf, PathBuf)> {
    let flat: Vec<&str> = values.map(|v| v.collect()).unwrap_or_default();
    flat.chunks(2)
        .map(|c| (PathBuf::from(c[0]), PathBuf::from(c[1])))
        .collect()
}

/// Retrieve the program arguments from clap matches.
fn get_args(matches: &clap::ArgMatches) -> anyhow::Result<Args> {
    let dim: usize = matches.value_of("dim").unwrap().parse()?;
    if !(2..=4).contains(&dim) {
        anyhow::bail!("--dim must be 2, 3 or 4, got {}", dim);
    }

    let metric = match matches.value_of("metric").unwrap().to_lowercase().as_str() {
        "ssd" => MetricKind::Ssd,
        "ncc" => {
            let radius = match matches.value_of("ncc-radius") {
                Some(r) => parse_schedule(r)?,
                None => vec![2; dim],
            };
            MetricKind::Ncc { radius }
        }
        "mi" => MetricKind::Mi {
            bins: matches.value_of("mi-bins").unwrap().parse()?,
        },
        other => anyhow::bail!("unknown metric \"{}\"", other),
    };

    let step_mode = match matches
        .value_of("step-mode")
        .unwrap()
        .to_lowercase()
        .as_str()
    {
        "const" => StepMode::Const,
        "scale" => StepMode::Scale,
        "scaledown" => StepMode::ScaleDown,
        other => anyhow::bail!("unknown step mode \"{}\"", other),
    };

    let weights: Vec<f32> = match matches.values_of("weight") {
        Some(values) => values
            .map(|w| w.parse::<f32>().context("bad --weight value"))
            .collect::<anyhow::Result<_>>()?,
        None => Vec::new(),
    };

    let parse_specs = |name: &str| -> anyhow::Result<Vec<TransformSpec>> {
        match matches.values_of(name) {
            Some(values) => values
                .map(|s| TransformSpec::parse(s).map_err(Into::into))
                .collect(),
            None => Ok(Vec::new()),
        }
    };

    let reslice_interp = match matches.values_of("reslice-interp") {
        None => ResliceInterp::Linear,
        Some(values) => {
            let parts: Vec<&str> = values.collect();
            match parts[0].to_lowercase().as_str() {
                "linear" => ResliceInterp::Linear,
                "nn" => ResliceInterp::Nearest,
                "label" => {
                    let sigma = parts
                        .get(1)
                        .context("label interpolation needs a sigma, e.g. label 0.2vox")?
                        .parse::<Sigma>()?;
                    ResliceInterp::Label { sigma }
                }
                other => anyhow::bail!("unknown reslice interpolation \"{}\"", other),
            }
        }
    };

    let reslice = parse_specs("reslice")?;
    let mode = if !reslice.is_empty() || matches.is_present("reslice-ref") {
        Mode::Reslice
    } else if matches.is_present("brute") {
        if matches.is_present("affine") {
            anyhow::bail!("--affine and --brute are mutually exclusive");
        }
        Mode::Brute(parse_schedule(matches.value_of("brute").unwrap())?)
    } else if matches.is_present("affine") {
        Mode::Affine
    } else {
        Mode::Deformable
    };

    let debug_deriv = if matches.is_present("debug-deriv") {
        Some(matches.value_of("debug-deriv-eps").unwrap().parse()?)
    } else {
        None
    };

    Ok(Args {
        dim,
        mode,
        pairs: path_pairs(matches.values_of("input")),
        weights,
        metric,
        iterations: parse_schedule(matches.value_of("iterations").unwrap())?,
        sigma_pre: matches.value_of("sigma-pre").unwrap().parse()?,
        sigma_post: matches.value_of("sigma-post").unwrap().parse()?,
        step: matches.value_of("step").unwrap().parse()?,
        step_mode,
        gradient_mask: matches.value_of("gradient-mask").map(PathBuf::from),
        initial_affine: matches.value_of("initial-affine").map(PathBuf::from),
        initial_transforms: parse_specs("initial-transform")?,
        noise: matches.value_of("noise").unwrap().parse()?,
        use_powell: matches.is_present("powell"),
        debug_deriv,
        output: matches.value_of("output").map(PathBuf::from),
        output_inverse: matches.value_of("output-inverse").map(PathBuf::from),
        inverse_exponent: matches.value_of("inverse-exponent").unwrap().parse()?,
        warp_precision: matches.value_of("warp-precision").unwrap().parse()?,
        threads: match matches.value_of("threads") {
            Some(n) => Some(n.parse()?),
            None => None,
        },
        dump_moving: matches.is_present("dump-moving"),
        dump_freq: matches.value_of("dump-freq").unwrap().parse()?,
        dump_dir: PathBuf::from(matches.value_of("dump-dir").unwrap()),
        reslice,
        reslice_ref: matches.value_of("reslice-ref").map(PathBuf::from),
        reslice_moving: path_pairs(matches.values_of("reslice-moving")),
        reslice_interp,
    })
}

/// Load all image pairs into memory.
fn load_pairs(args: &Args, volumes: &mut FileVolumes) -> anyhow::Result<Vec<ImagePair>> {
    if args.pairs.is_empty() {
        anyhow::bail!("no image pairs; use --input FIXED MOVING");
    }
    log::info!("Loading {} image pair(s) ...", args.pairs.len());
    let pb = if log::log_enabled!(log::Level::Info) {
        indicatif::ProgressBar::new(2 * args.pairs.len() as u64)
    } else {
        indicatif::ProgressBar::hidden()
    };
    let mut pairs = Vec::with_capacity(args.pairs.len());
    for (i, (fixed_path, moving_path)) in args.pairs.iter().enumerate() {
        let fixed = volumes
            .read_volume(fixed_path, args.dim)
            .with_context(|| format!("failed to read {}", fixed_path.display()))?;
        pb.inc(1);
        let moving = volumes
            .read_volume(moving_path, args.dim)
            .with_context(|| format!("failed to read {}", moving_path.display()))?;
        pb.inc(1);
        let weight = args.weights.get(i).copied().unwrap_or(1.0);
        pairs.push(ImagePair {
            fixed,
            moving,
            weight,
        });
    }
    pb.finish();
    Ok(pairs)
}

fn build_pyramid(
    args: &Args,
    levels: usize,
    volumes: &mut FileVolumes,
) -> anyhow::Result<Pyramid> {
    let pairs = load_pairs(args, volumes)?;
    let mask = match &args.gradient_mask {
        Some(path) => Some(
            volumes
                .read_volume(path, args.dim)
                .with_context(|| format!("failed to read mask {}", path.display()))?,
        ),
        None => None,
    };
    let noise = match args.metric {
        MetricKind::Ncc { .. } => args.noise,
        _ => 0.0,
    };
    Ok(Pyramid::build(pairs, levels, None, noise, mask.as_ref())?)
}

fn write_warp(
    volumes: &mut FileVolumes,
    path: &Path,
    field: &Image,
    precision: f64,
) -> anyhow::Result<()> {
    let physical = field_voxel_to_physical(field, precision);
    volumes
        .write_volume(path, &physical)
        .with_context(|| format!("failed to write {}", path.display()))?;
    log::info!("Wrote {}", path.display());
    Ok(())
}

fn run_deformable(args: Args) -> anyhow::Result<()> {
    let mut volumes = FileVolumes;
    let pyramid = build_pyramid(&args, args.iterations.len(), &mut volumes)?;

    let seed = if !args.initial_transforms.is_empty() {
        let reference = pyramid.reference_space(pyramid.levels().len() - 1).clone();
        let field = chain::compose_chain(&args.initial_transforms, &reference, &mut volumes)?;
        Some(InitialSeed::Field(field))
    } else if let Some(path) = &args.initial_affine {
        Some(InitialSeed::Affine(read_affine_matrix(path, args.dim)?))
    } else {
        None
    };

    let config = DeformableConfig {
        iterations: args.iterations.clone(),
        metric: args.metric.clone(),
        sigma_pre: args.sigma_pre,
        sigma_post: args.sigma_post,
        step_mode: args.step_mode,
        epsilon: args.step,
    };

    let mut dump_sink = FileVolumes;
    let dump_dir = args.dump_dir.clone();
    let dump_freq = args.dump_freq.max(1);
    let dump_moving = args.dump_moving;
    if dump_moving {
        std::fs::create_dir_all(&dump_dir)
            .with_context(|| format!("could not create {}", dump_dir.display()))?;
    }
    let mut observer = |event: &IterationEvent| {
        if dump_moving && event.iteration % dump_freq == 0 {
            let path = dump_dir.join(format!(
                "moving_level{:02}_iter{:04}.nii.gz",
                event.level, event.iteration
            ));
            let warped = event.eval.extract_warped();
            if let Err(e) = dump_sink.write_volume(&path, &warped) {
                log::warn!("dump failed: {}", e);
            }
        }
    };

    let field = deformable::run(&pyramid, &config, seed.as_ref(), Some(&mut observer))?;

    let output = args
        .output
        .as_ref()
        .context("deformable mode needs --output")?;
    write_warp(&mut volumes, output, &field, args.warp_precision)?;

    if let Some(inverse_path) = &args.output_inverse {
        let (inverse, residual) = deformable::invert_field(
            &field,
            args.inverse_exponent,
            INVERSE_ITERATIONS,
            INVERSE_TOLERANCE,
        );
        if residual > INVERSE_TOLERANCE {
            log::warn!(
                "inverse warp converged to residual {:.3e} only; writing best effort",
                residual
            );
        }
        write_warp(&mut volumes, inverse_path, &inverse, args.warp_precision)?;
    }
    Ok(())
}

fn run_affine(args: Args) -> anyhow::Result<()> {
    let mut volumes = FileVolumes;
    let pyramid = build_pyramid(&args, args.iterations.len(), &mut volumes)?;

    let seed = match &args.initial_affine {
        Some(path) => AffineSeed::Ras(read_affine_matrix(path, args.dim)?),
        None => AffineSeed::Identity,
    };
    let config = AffineConfig {
        iterations: args.iterations.clone(),
        metric: args.metric.clone(),
        use_powell: args.use_powell,
        tolerance: 1e-8,
        jitter_seed: 42,
        debug_deriv: args.debug_deriv,
    };
    let matrix = affine::run(&pyramid, &config, &seed)?;

    let output = args.output.as_ref().context("affine mode needs --output")?;
    write_affine_matrix(output, &matrix)?;
    log::info!("Wrote {}", output.display());
    Ok(())
}

fn run_brute(args: Args, search_radius: Vec<usize>) -> anyhow::Result<()> {
    // A single radius value broadcasts to all axes.
    let search_radius = if search_radius.len() == 1 && args.dim > 1 {
        vec![search_radius[0]; args.dim]
    } else {
        search_radius
    };
    let mut volumes = FileVolumes;
    let pyramid = build_pyramid(&args, 1, &mut volumes)?;
    let field = brute::run(pyramid.finest(), &args.metric, &search_radius)?;

    let output = args.output.as_ref().context("brute mode needs --output")?;
    write_warp(&mut volumes, output, &field, args.warp_precision)
}

fn run_reslice(args: Args) -> anyhow::Result<()> {
    let mut volumes = FileVolumes;
    let reference_path = args
        .reslice_ref
        .as_ref()
        .context("reslice mode needs --reslice-ref")?;
    let reference = volumes
        .read_volume(reference_path, args.dim)?
        .geometry()
        .clone();

    let field = chain::compose_chain(&args.reslice, &reference, &mut volumes)?;
    if args.reslice_moving.is_empty() {
        anyhow::bail!("reslice mode needs --reslice-moving IN OUT");
    }
    for (input, output) in args.reslice_moving.iter() {
        let moving = volumes
            .read_volume(input, args.dim)
            .with_context(|| format!("failed to read {}", input.display()))?;
        let resliced = chain::reslice(&moving, &field, &args.reslice_interp)?;
        volumes
            .write_volume(output, &resliced)
            .with_context(|| format!("failed to write {}", output.display()))?;
        log::info!("Wrote {}", output.display());
    }
    Ok(())
}

/// Start actual program with command line arguments successfully parsed.
fn run(args: Args) -> anyhow::Result<()> {
    match args.mode {
        Mode::Deformable => run_deformable(args),
        Mode::Affine => run_affine(args),
        Mode::Brute(ref radius) => {
            let radius = radius.clone();
            run_brute(args, radius)
        }
        Mode::Reslice => run_reslice(args),
    }
}
