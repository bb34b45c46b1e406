use std::io;

use clap::Parser;

use dnsbpf::classifier;
use dnsbpf::cli::{Cli, Command, CompileArgs, ScriptArgs};
use dnsbpf::error::DnsbpfError;
use dnsbpf::output::{self, file::Destination};
use dnsbpf::script::{self, ScriptRequest};

fn exit_code(err: &DnsbpfError) -> i32 {
    match err {
        DnsbpfError::InvalidParameters(_) => 2,
        DnsbpfError::ProgramTooLong { .. }
        | DnsbpfError::MalformedBytecode(_)
        | DnsbpfError::Assembly(_) => 3,
        _ => 4,
    }
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(exit_code(&e));
        }
    }
}

fn run(cli: Cli) -> Result<(), DnsbpfError> {
    match cli.command {
        Command::Script(args) => run_script(&args),
        Command::Compile(args) => run_compile(&args),
    }
}

fn run_script(args: &ScriptArgs) -> Result<(), DnsbpfError> {
    let defaults = args.defaults();
    let request = ScriptRequest {
        kind: args.classifier.kind,
        params: &args.classifier.params,
        family: args.classifier.family(),
        output: args.write.as_deref(),
        defaults: &defaults,
    };

    // Everything is generated and validated before the destination is touched.
    let generated = script::generate(&request)?;
    log::debug!("deployment context: {:?}", generated.context);

    let default_name = script::default_file_name(
        request.kind,
        request.family,
        &generated.classifier.name,
    );
    let destination = Destination::resolve(args.write.as_deref(), &default_name);
    output::file::write_script(&destination, &generated.contents)?;

    if let Destination::File(path) = &destination {
        log::info!(
            "set {} for {}: wrote {}",
            generated.context.set_name,
            request.family,
            path.display()
        );
        eprintln!("Generated file {:?}", path.display().to_string());
    }
    Ok(())
}

fn run_compile(args: &CompileArgs) -> Result<(), DnsbpfError> {
    let result = classifier::generate(
        args.classifier.kind,
        &args.classifier.params,
        args.classifier.family(),
    )?;
    let mut stdout = io::stdout().lock();
    output::write_classifier(&result, args.format, &mut stdout)
}
