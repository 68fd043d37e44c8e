use anyhow::Result;
use clap::{Parser, Subcommand};
use fcflash_core::ContainerBuilder;
use fcflash_core::ihex;
use std::path::PathBuf;
use std::process::Command;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Tasks for the project", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the project
    Build,
    /// Run the test suite
    Test,
    /// Run the CLI
    Run {
        /// Arguments passed to fcflash
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },
    /// Write sample .px4 and .ihx files for bench testing
    Samples {
        #[arg(long, default_value = "target/samples")]
        out: PathBuf,
        /// Board id stamped into the container
        #[arg(long, default_value_t = 9)]
        board_id: u32,
        /// Image size in bytes
        #[arg(long, default_value_t = 64 * 1024)]
        size: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Build => cargo(&["build", "--workspace"], "Build")?,
        Commands::Test => cargo(&["test", "--workspace"], "Tests")?,
        Commands::Run { args } => {
            println!("Running CLI...");
            let mut cmd = vec!["run", "-p", "fcflash-cli", "--"];
            cmd.extend(args.iter().map(String::as_str));
            cargo(&cmd, "Run")?;
        }
        Commands::Samples {
            out,
            board_id,
            size,
        } => {
            std::fs::create_dir_all(out)?;
            let image: Vec<u8> = (0..*size).map(|i| (i * 7 + 3) as u8).collect();

            let px4 = out.join("sample.px4");
            ContainerBuilder::new(*board_id)
                .image(&image)?
                .version("0.0.0-sample")
                .description("xtask sample image")
                .set("image_maxsize", *size as u64)
                .write_to(&px4)?;
            println!("Wrote {}", px4.display());

            let ihx = out.join("sample.ihx");
            let mut text = ihex::encode_bytes(0, &image[..(*size).min(0xF800)])?.join("\n");
            text.push('\n');
            std::fs::write(&ihx, text)?;
            println!("Wrote {}", ihx.display());
        }
    }

    Ok(())
}

fn cargo(args: &[&str], what: &str) -> Result<()> {
    println!("cargo {}", args.join(" "));
    let status = Command::new("cargo").args(args).status()?;
    if !status.success() {
        anyhow::bail!("{} failed", what);
    }
    Ok(())
}
