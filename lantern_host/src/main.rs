use anyhow::Result;

mod cli;
mod params;
mod session;

fn main() -> Result<()> {
    env_logger::init();
    let request = cli::parse()?;

    let summary = session::run(&request)?;
    session::print_summary(&summary);

    if let Some(path) = request.json_out.as_ref() {
        session::write_summary(path, &summary)?;
        println!("Saved run summary JSON to {}", path.display());
    }
    Ok(())
}
