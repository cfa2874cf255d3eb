//! trck compiler CLI.
//!
//! Two halves, connected by the AST JSON wire format:
//!
//! - `compile`/`lex` run the front end on a `.tr` source file;
//! - `matcher`/`header`/`proto` read AST JSON on stdin and write one
//!   generated C unit to stdout.
//!
//! Every mode renders into memory first, so failures leave no partial
//! output; diagnostics are a single line on stderr and a non-zero exit.

use clap::{CommandFactory, Parser as ClapParser, Subcommand};
use clap_complete::{generate, Shell};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process;

#[derive(ClapParser)]
#[command(name = "trckc")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "trck compiler - compile trail matchers to C", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a .tr program and write the flat-rule AST JSON to stdout
    Compile {
        /// Input .tr source file ('-' reads stdin)
        input: PathBuf,
    },

    /// Dump the layout-filtered token stream of a .tr program
    Lex {
        /// Input .tr source file ('-' reads stdin)
        input: PathBuf,
    },

    /// Generate the matcher C unit from AST JSON on stdin
    Matcher {
        /// Extra headers to #include in the generated unit
        #[arg(value_name = "HEADER")]
        includes: Vec<String>,
    },

    /// Generate the header unit from AST JSON on stdin
    Header,

    /// Generate the protobuf serialization unit from AST JSON on stdin
    Proto {
        /// Proto descriptor TOML (package, message, path)
        #[arg(long, value_name = "FILE")]
        descriptor: PathBuf,

        /// Extra headers to #include in the generated unit
        #[arg(long = "include", value_name = "HEADER")]
        includes: Vec<String>,
    },

    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Compile { input } => run_compile(&input),
        Commands::Lex { input } => run_lex(&input),
        Commands::Matcher { includes } => run_matcher(&includes),
        Commands::Header => run_header(),
        Commands::Proto {
            descriptor,
            includes,
        } => run_proto(&descriptor, &includes),
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "trckc", &mut io::stdout());
            Ok(())
        }
    };

    if let Err(message) = result {
        eprintln!("Error: {}", message);
        process::exit(1);
    }
}

/// Read a source file, with `-` meaning stdin.
fn read_source(path: &Path) -> Result<String, String> {
    if path == Path::new("-") {
        let mut source = String::new();
        io::stdin()
            .read_to_string(&mut source)
            .map_err(|e| format!("failed to read stdin: {}", e))?;
        Ok(source)
    } else {
        std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {}", path.display(), e))
    }
}

fn read_stdin_json() -> Result<String, String> {
    let mut json = String::new();
    io::stdin()
        .read_to_string(&mut json)
        .map_err(|e| format!("failed to read stdin: {}", e))?;
    Ok(json)
}

fn run_compile(input: &Path) -> Result<(), String> {
    let source = read_source(input)?;
    let ast = trckc::compile_source(&source).map_err(|e| e.to_string())?;
    let json = trckc::ast_to_json(&ast).map_err(|e| e.to_string())?;
    println!("{}", json);
    Ok(())
}

fn run_lex(input: &Path) -> Result<(), String> {
    let source = read_source(input)?;
    let tokens = trckc::lexer::tokenize(&source).map_err(|e| e.to_string())?;
    for token in tokens {
        println!("{}\t{}", token.line, token.tok.describe());
    }
    Ok(())
}

fn run_matcher(includes: &[String]) -> Result<(), String> {
    let config = trckc::CompilerConfig::new().with_includes(includes.iter().cloned());
    let json = read_stdin_json()?;
    let unit = trckc::matcher_from_json(&json, &config).map_err(|e| e.to_string())?;
    print!("{}", unit);
    Ok(())
}

fn run_header() -> Result<(), String> {
    let json = read_stdin_json()?;
    let unit = trckc::header_from_json(&json).map_err(|e| e.to_string())?;
    print!("{}", unit);
    Ok(())
}

fn run_proto(descriptor_path: &Path, includes: &[String]) -> Result<(), String> {
    let descriptor_text = std::fs::read_to_string(descriptor_path)
        .map_err(|e| format!("failed to read {}: {}", descriptor_path.display(), e))?;
    let mut descriptor =
        trckc::ProtoDescriptor::from_toml(&descriptor_text).map_err(|e| e.to_string())?;
    // Schema path is relative to the descriptor file.
    if descriptor.path.is_relative() {
        if let Some(base) = descriptor_path.parent() {
            descriptor.path = base.join(&descriptor.path);
        }
    }
    let config = trckc::CompilerConfig::new()
        .with_includes(includes.iter().cloned())
        .with_proto(descriptor);
    let json = read_stdin_json()?;
    let unit = trckc::proto_from_json(&json, &config).map_err(|e| e.to_string())?;
    print!("{}", unit);
    Ok(())
}
