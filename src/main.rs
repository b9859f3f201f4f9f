use std::fs;

use anyhow::{Context, Result, bail};
use clap::Parser;

use graft::Pattern;

/// Compile a pattern and run it against input text.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Pattern to compile
    pattern: String,

    /// Input text to match
    input: Option<String>,

    /// Read the input from a file instead
    #[arg(short = 'f', long, value_name = "FILE")]
    file: Option<String>,

    /// Scan for the first match instead of anchoring at the start
    #[arg(short = 's', long)]
    find: bool,

    /// Accept a prefix match instead of requiring the whole input
    #[arg(short = 'p', long)]
    prefix: bool,

    /// Print the token tree of the match
    #[arg(short = 't', long)]
    tree: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let pattern = Pattern::new(&args.pattern)?;

    let input: Vec<u8> = match (&args.input, &args.file) {
        (Some(text), None) => text.clone().into_bytes(),
        (None, Some(path)) => fs::read(path).with_context(|| format!("failed to read {path}"))?,
        (None, None) => bail!("no input given"),
        (Some(_), Some(_)) => bail!("give either inline input or --file, not both"),
    };

    let mut state = pattern.state();
    let result = if args.find {
        pattern.find_with(&input, 0, &mut state).map(|(tok, _)| tok)
    } else if args.prefix {
        pattern.match_at_with(&input, 0, &mut state)
    } else {
        pattern.definition().matches_with(&input, &mut state)
    };

    let Some(tok) = result else {
        match state.hint_message(&input) {
            Some(message) => bail!("no match ({message})"),
            None => bail!("no match"),
        }
    };

    println!("matched [{}..{})", tok.start(), tok.end());
    for (slot, name) in pattern.definition().captures() {
        if let Some((s, e)) = state.capture(slot) {
            println!(
                "  @{name} = {:?} [{s}..{e})",
                String::from_utf8_lossy(&input[s..e])
            );
        }
    }
    if args.tree {
        print!("{}", tok.dump(pattern.definition(), &input));
    }
    Ok(())
}
