use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;

use clap::Parser;
use sndconf::{
    error::{ConfError, Result},
    eval::Evaluator,
    funcs::FuncTable,
    json::to_json_pretty,
    lexer::TOPLEVEL_NAME,
    parser::{load_file, load_str},
    save::save_string,
    search::search_alias,
    tree::{NodeId, Tree},
    update::{Config, UpdateSettings},
};

/// Parse sound configuration files and print the resulting tree
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration files, loaded in order (stdin when none are given)
    #[arg(value_name = "FILE")]
    files: Vec<PathBuf>,

    /// Print JSON instead of configuration text
    #[arg(long)]
    json: bool,

    /// Load through the update cache (ALSA_CONFIG_PATH, or FILEs when given)
    #[arg(long)]
    update: bool,

    /// Print the node at KEY, following string aliases
    #[arg(long, value_name = "KEY")]
    search: Option<String>,

    /// Print the expanded definition NAME[:ARGS]
    #[arg(long, value_name = "NAME", conflicts_with = "search")]
    definition: Option<String>,

    /// Key prefix tried when KEY or NAME is not found at the top level
    #[arg(long, value_name = "BASE")]
    base: Option<String>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();

    let stdin_text = if args.files.is_empty() && !args.update {
        let mut input = String::new();
        if let Err(err) = io::stdin().read_to_string(&mut input) {
            eprintln!("cannot read stdin: {}", err);
            std::process::exit(1);
        }
        Some(input)
    } else {
        None
    };

    match run(&args, stdin_text.as_deref()) {
        Ok(output) => print!("{}", output),
        Err(err) => {
            report(&err, stdin_text.as_deref());
            std::process::exit(1);
        }
    }
}

fn run(args: &Args, stdin_text: Option<&str>) -> Result<String> {
    let base = args.base.as_deref();

    if args.update {
        let settings = if args.files.is_empty() {
            UpdateSettings::default()
        } else {
            let list: Vec<String> = args.files.iter().map(|f| f.display().to_string()).collect();
            UpdateSettings::with_paths(list.join(":"))
        };
        let mut config = Config::open(settings);
        config.update()?;
        let root = config
            .root()
            .ok_or_else(|| ConfError::not_found("configuration"))?;
        let node = match (&args.search, &args.definition) {
            (_, Some(name)) => config.search_definition(base, name)?,
            (Some(key), None) => search_alias(config.tree(), root, base, key)?,
            (None, None) => root,
        };
        return Ok(render(args, config.tree(), node));
    }

    let mut tree = Tree::new();
    let root = tree.top();
    match stdin_text {
        Some(text) => load_str(&mut tree, root, text)?,
        None => {
            for file in &args.files {
                load_file(&mut tree, root, file)?;
            }
        }
    }

    let funcs = FuncTable::with_builtins();
    let node = match (&args.search, &args.definition) {
        (_, Some(name)) => Evaluator::new(&funcs).search_definition(&mut tree, root, base, name)?,
        (Some(key), None) => search_alias(&tree, root, base, key)?,
        (None, None) => root,
    };
    Ok(render(args, &tree, node))
}

fn render(args: &Args, tree: &Tree, node: NodeId) -> String {
    let mut out = if args.json {
        to_json_pretty(tree, node)
    } else {
        save_string(tree, node)
    };
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out
}

fn report(err: &ConfError, stdin_text: Option<&str>) {
    let ConfError::Syntax { file, position, .. } = err else {
        eprintln!("error: {}", err);
        return;
    };

    let source = if file == TOPLEVEL_NAME {
        stdin_text.map(str::to_owned)
    } else {
        fs::read_to_string(file).ok()
    };
    let line_text = source
        .as_deref()
        .and_then(|text| text.lines().nth(position.line.saturating_sub(1)))
        .unwrap_or("");

    eprintln!("ERROR AT LINE {}:", position.line);
    eprintln!("{}", line_text);

    // Column counts the offending byte itself
    let mut underline = " ".repeat(position.column.saturating_sub(1));
    underline.push('^');
    eprintln!("{}", underline);
    eprintln!("{}", err);
    eprintln!();
}
