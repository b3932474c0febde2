use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{CommandFactory, Parser};

use report_assembler::assembly::{list_placeholders, roundtrip, Assembler};
use report_assembler::config::{
    init_default_config, locate_and_load, CONFIG_ENV, CONFIG_FILE_NAME,
};
use report_assembler::job::JobSpec;
use report_assembler::logging;

#[derive(Parser, Debug)]
#[command(name = "report-assembler")]
#[command(
    about = "Assemble report documents from a .docx template and a JSON job",
    long_about = None
)]
struct Args {
    /// Generate the default config file, then exit
    #[arg(long)]
    init_config: bool,

    /// Directory to write the config file to (default: current directory)
    #[arg(long, value_name = "DIR")]
    init_config_dir: Option<PathBuf>,

    /// Overwrite an existing config file when used with --init-config
    #[arg(long)]
    force: bool,

    /// Job file (JSON), or a .docx template with --roundtrip-only / --list-placeholders
    #[arg(value_name = "JOB")]
    input: Option<PathBuf>,

    /// Output .docx (default: job `output`, else <template_stem>_out.docx)
    #[arg(short, long, value_name = "DOCX")]
    output: Option<PathBuf>,

    /// Config file path (default: search for report-assembler.toml upwards)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Skip table-of-contents recalculation
    #[arg(long)]
    no_toc: bool,

    /// Also export a PDF next to the output
    #[arg(long)]
    pdf: bool,

    /// Only unpack + repack the template given as input (no edits)
    #[arg(long)]
    roundtrip_only: bool,

    /// Print the placeholders found in the template given as input, then exit
    #[arg(long)]
    list_placeholders: bool,

    /// Write the assembly report as JSON
    #[arg(long, value_name = "JSON")]
    report_json: Option<PathBuf>,

    /// Debug logging (RUST_LOG still wins)
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.init_config {
        let dir = args
            .init_config_dir
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
        let cfg_path = init_default_config(&dir, args.force).context("init default config")?;
        eprintln!("Wrote config: {}", cfg_path.display());
        return Ok(());
    }

    let input = match args.input.clone() {
        Some(p) => p,
        None => {
            let mut cmd = Args::command();
            cmd.print_help().context("print help")?;
            eprintln!(
                "\n\nUSAGE:\n  report-assembler <job.json>\n\n\
                 TIPS:\n  - Default config search: {CONFIG_FILE_NAME} (upwards), \
                 or set {CONFIG_ENV}.\n  \
                 - report-assembler --init-config writes a commented default config.\n"
            );
            return Ok(());
        }
    };

    let workdir = input
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let workdir = workdir.canonicalize().unwrap_or(workdir);
    let loaded = locate_and_load(args.config.clone(), &workdir).context("load config")?;
    logging::init(&loaded.config.logging.level, args.verbose);
    if let Some(p) = loaded.path.as_ref() {
        tracing::debug!(config = %p.display(), "using config");
    }

    if args.list_placeholders {
        let found = list_placeholders(&input)?;
        for (part, codes) in &found {
            println!("{part}");
            for code in codes {
                println!("  {{{{{code}}}}}");
            }
        }
        return Ok(());
    }

    if args.roundtrip_only {
        let output = args.output.clone().unwrap_or_else(|| {
            let stem = input.file_stem().and_then(|s| s.to_str()).unwrap_or("output");
            input.with_file_name(format!("{stem}_roundtrip.docx"))
        });
        roundtrip(&input, &output)?;
        eprintln!("Wrote: {}", output.display());
        return Ok(());
    }

    let job = JobSpec::load(&input)?;
    let request = job
        .into_request(&workdir, &loaded, args.output.clone())
        .context("build assembly request")?;

    let mut options = loaded.config.assembly_options();
    if args.no_toc {
        options.recalculate_toc = false;
    }
    if args.pdf {
        options.export_pdf = true;
    }
    let gate = if options.recalculate_toc || options.export_pdf {
        loaded.config.automation_gate()
    } else {
        None
    };

    let assembler = Assembler::new(options, gate);
    let report = assembler
        .assemble(&request)
        .with_context(|| format!("assemble {}", request.output.display()))?;

    if let Some(path) = args.report_json.as_ref() {
        let json = serde_json::to_vec_pretty(&report).context("serialize report")?;
        std::fs::write(path, json).with_context(|| format!("write report: {}", path.display()))?;
    }
    eprintln!("Wrote: {}", report.output.display());
    if let Some(pdf) = report.pdf.as_ref() {
        eprintln!("Wrote: {}", pdf.display());
    }
    Ok(())
}
