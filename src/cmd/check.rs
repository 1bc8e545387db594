//! A subcommand making sure various things are working. Useful before
//! deploying a new version, as it catches many problems early.

use crate::{
    apperr::Catalog,
    args::{Args, Shared},
    config::Config,
    db,
    load_config_and_init_logger,
    prelude::*,
};


pub(crate) async fn run(shared: &Shared, args: &Args) -> Result<()> {
    let config = load_config_and_init_logger(shared, args, "check")
        .context("failed to load config: cannot proceed with `check` command")?;

    info!("Starting to verify various things...");
    let referenced_files = check_referenced_files(&config);
    let catalog: Result<Catalog> = Catalog::embedded().map_err(Into::into);
    let db_pool = db::create_pool(&config.db).await;
    info!("Done verifing various things");


    // Print summary after all log output
    let mut any_errors = false;
    println!();
    bunt::println!("{$bold+blue+intense}Summary{/$}");
    println!();
    print_outcome(&mut any_errors, "Load configuration", &Ok(()));
    print_outcome(&mut any_errors, "Checking all referenced files", &referenced_files);
    print_outcome(&mut any_errors, "Loading error messages", &catalog);
    print_outcome(&mut any_errors, "Connection to DB", &db_pool);

    println!();
    if any_errors {
        bunt::println!("{$red+intense}➡  Errors have occured!{/$}");
        std::process::exit(1);
    } else {
        bunt::println!("{$green+intense}⮕  Everything OK{/$} \
            {$dimmed}(notes-api probably works in this environment){/$}");
        Ok(())
    }
}

fn print_outcome<T>(any_errors: &mut bool, label: &str, result: &Result<T>) {
    match result {
        Ok(_) => {
            bunt::println!(" ▸ {[bold+intense]}  {$green+bold}✔ ok{/$}", label);
        }
        Err(e) => {
            *any_errors = true;
            bunt::println!(" ▸ {[bold+intense]}  {$red+bold}✘ error{/$}", label);
            bunt::println!("      {$red}▶▶▶ {$bold}Error:{/$}{/$} {[yellow+intense]}", e);
            println!();
            if e.chain().len() > 1 {
                bunt::println!("      {$red+italic}Caused by:{/$}");
            }

            for (i, cause) in e.chain().skip(1).enumerate() {
                print!("       {: >1$}", "", i * 2);
                println!("‣ {cause}");
            }
            println!();
        }
    }
}

fn check_referenced_files(config: &Config) -> Result<()> {
    config.db.check_server_cert()?;

    if let Some(path) = &config.http.unix_socket {
        let dir = path.parent().unwrap_or(path);
        debug!("Checking that '{}' exists...", dir.display());
        if !dir.is_dir() {
            bail!("directory of unix socket '{}' does not exist", path.display());
        }
    }

    Ok(())
}
