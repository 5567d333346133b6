use std::path::{Path, PathBuf};
use std::{env, fs, io};

use anyhow::{anyhow, bail, Context, Result};

use kindle::bytecode::disasm::{disassemble, print_stats};
use kindle::compiler::Compiler;
use kindle::frontend::TokenDumper;
use kindle::grammar::Grammar;
use kindle::lexer::tokenize;
use kindle::logging::{init_logging, LoggingConfig};
use kindle::parser::parse_source;

fn main() {
    init_logging(LoggingConfig::default());
    if let Err(err) = run() {
        eprintln!("error: {:#}", err);
        std::process::exit(1);
    }
}

/// Value following `flag`, if present.
fn option_value<'a>(args: &'a [String], flag: &str) -> Result<Option<&'a String>> {
    match args.iter().position(|a| a == flag) {
        Some(i) => args
            .get(i + 1)
            .map(Some)
            .with_context(|| format!("{} needs a value", flag)),
        None => Ok(None),
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    if args.is_empty() || args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }

    let tokens_only = args.iter().any(|a| a == "--tokens");
    let no_color = args.iter().any(|a| a == "--no-color");
    let pretty = args.iter().any(|a| a == "--pretty");
    let ast = args.iter().any(|a| a == "--ast");
    let dis = args.iter().any(|a| a == "--dis");
    let stats = args.iter().any(|a| a == "--stats");
    let emit_dir = option_value(&args, "--emit")?;
    let grammar_file = option_value(&args, "--grammar")?;

    // first argument that is neither a flag nor a flag's value
    let valued = [emit_dir, grammar_file];
    let Some(filename) = args.iter().find(|a| !a.starts_with('-') && !valued.contains(&Some(*a))) else {
        bail!("no input file given");
    };
    let emit = emit_dir.map(PathBuf::from);

    let grammar = match grammar_file {
        Some(path) => {
            let text = fs::read_to_string(path).with_context(|| format!("failed to read grammar '{}'", path))?;
            Grammar::from_json(&text).with_context(|| format!("invalid grammar '{}'", path))?
        }
        None => Grammar::default(),
    };
    let source = fs::read_to_string(filename).with_context(|| format!("failed to read '{}'", filename))?;

    if tokens_only {
        let mut dumper = TokenDumper::new();
        if no_color {
            dumper = dumper.no_color();
        }
        if pretty {
            dumper = dumper.pretty();
        }
        let mut stream = tokenize(&source, &grammar);
        dumper.dump(&mut stream, &mut io::stdout().lock())?;
        if let Some(err) = stream.take_error() {
            return Err(err.located(filename, &source).into());
        }
        return Ok(());
    }

    if ast {
        let module = parse_source(&source, filename, &grammar).map_err(|e| e.located(filename, &source))?;
        println!("{:#?}", module);
        return Ok(());
    }

    let compiler = Compiler::new(grammar);
    let module = compiler.compile_source(&source, filename)?;
    log::info!("compiled {} definitions from {}", module.items.len(), filename);

    for item in &module.items {
        if dis {
            print!("{}", disassemble(&item.unit)?);
            if let Some(defaults) = &item.defaults {
                print!("{}", disassemble(defaults)?);
            }
        }
        if stats {
            print_stats(&item.unit)?;
        }
        if !dis && !stats && emit.is_none() {
            println!(
                "{}: {} nodes, {} bytes, stack {}",
                item.name,
                item.node_count,
                item.unit.code.len(),
                item.unit.stacksize
            );
        }
    }

    if let Some(dir) = emit {
        emit_units(&dir, &module.items)?;
    }
    Ok(())
}

/// Writes each definition's outer unit as `<dir>/<name>.knc`.
fn emit_units(dir: &Path, items: &[kindle::compiler::CompiledItem]) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("failed to create '{}'", dir.display()))?;
    for item in items {
        let path = dir.join(format!("{}.knc", item.name));
        let bytes = item
            .unit
            .to_bytes()
            .map_err(|e| anyhow!("failed to serialize '{}': {}", item.name, e))?;
        fs::write(&path, bytes).with_context(|| format!("failed to write '{}'", path.display()))?;
        log::info!("wrote {}", path.display());
    }
    Ok(())
}

fn print_usage() {
    println!("kindle - compiler for declarative UI definitions");
    println!();
    println!("Usage:");
    println!("  kindle <file.kn>                  Compile and summarize definitions");
    println!("  kindle --tokens <file.kn>         Show tokens (--no-color, --pretty)");
    println!("  kindle --ast <file.kn>            Show the syntax tree");
    println!("  kindle --dis <file.kn>            Disassemble compiled units");
    println!("  kindle --stats <file.kn>          Show per-unit statistics");
    println!("  kindle --emit <dir> <file.kn>     Write compiled units to <dir>");
    println!("  kindle --grammar <g.json> ...     Use a custom grammar");
    println!("  kindle --help, -h                 Show this help");
}
