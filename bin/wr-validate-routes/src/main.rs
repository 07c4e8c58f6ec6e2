//! Standalone routes.yaml validator.
//!
//! Shares the registry loader with the server, so a file that passes here is
//! exactly a file the server will accept. Exit codes: 0 valid, 1 invalid.

use clap::Parser;
use wr_routes::RouteRegistry;

#[derive(Parser)]
#[command(name = "wr-validate-routes", version, about = "Validate a routes.yaml file")]
struct Args {
    /// Path to the routes file.
    #[arg(default_value = "routes.yaml")]
    routes_file: String,
}

fn main() {
    let args = Args::parse();

    println!("Validating routes file: {}", args.routes_file);
    println!("{}", "-".repeat(50));

    let registry = match RouteRegistry::load(&args.routes_file) {
        Ok(registry) => registry,
        Err(e) => {
            eprintln!("VALIDATION FAILED");
            eprintln!();
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    println!("VALIDATION PASSED");
    println!();
    println!("Loaded {} route(s):", registry.len());

    for (i, route) in registry.list().iter().enumerate() {
        println!();
        println!("{}. Route: {}", i + 1, route.route_id);
        println!("   Target URL:      {}", route.target_url);
        println!("   Mode:            {}", route.mode);
        println!("   Parallelism:     {}", route.parallelism);
        println!("   Max Retries:     {}", route.max_retries);
        println!("   Retry Backoff:   {}", route.retry_backoff);
        println!("   Expected Status: {}", route.listed_expected_status());

        if let Some(hours) = route.delivered_ttl_hours {
            println!("   Delivered TTL:   {hours} hours");
        }
        if let Some(hours) = route.failed_ttl_hours {
            println!("   Failed TTL:      {hours} hours");
        }
        if route.signing_secret.is_some() {
            println!("   Signing:         enabled");
        }
        if !route.event_types.is_empty() {
            println!("   Event Types:     {}", route.event_types.join(", "));
        }
    }

    println!();
    println!("All routes are valid.");
}
