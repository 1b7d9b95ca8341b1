use cortex_core::{Cortex, CortexConfig, GraphFormat, GraphView};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    println!("=== Cortex Basic Usage Example ===\n");

    // 1. Open a knowledge base
    println!("1. Opening knowledge base...");
    let cortex = Cortex::open("./data/knowledge", CortexConfig::default())?;
    println!("   ✓ Opened at {}\n", cortex.root().display());

    // 2. Write a few files
    println!("2. Writing files...");
    cortex.write_file(
        "README.md",
        "# Project\n\nStart with the [architecture](ARCHITECTURE.md).\n",
        None,
    )?;
    cortex.write_file(
        "ARCHITECTURE.md",
        "# Architecture\n\n## Storage\nFiles on disk, one index.\n\n## Setup\n{{include:setup.md}}\n",
        None,
    )?;
    let setup = cortex.write_file("setup.md", "Run `make install`.\n", None)?;
    println!("   ✓ setup.md is at v{} ({})\n", setup.version, setup.hash.short());

    // 3. Optimistic update
    println!("3. Updating with the hash we read...");
    let seen = cortex.read_file("setup.md")?;
    let updated = cortex.write_file("setup.md", "Run `make install` then `make test`.\n", Some(&seen.hash))?;
    println!("   ✓ setup.md is now v{}\n", updated.version);

    // 4. Render with includes expanded
    println!("4. Resolving ARCHITECTURE.md...");
    println!("{}\n", cortex.resolve_transclusions("ARCHITECTURE.md", None)?);

    // 5. Loading order and graph
    println!("5. Loading order:");
    for id in cortex.loading_order(None)? {
        println!("   - {}", id);
    }
    if let GraphView::Diagram(diagram) = cortex.get_dependency_graph(GraphFormat::Diagram) {
        println!("\n{}", diagram);
    }

    // 6. History
    println!("6. History of setup.md:");
    for version in cortex.get_version_history("setup.md", None)? {
        println!("   v{} {} {}", version.version, version.change_type, version.timestamp);
    }
    let first = cortex.rollback("setup.md", 1)?;
    println!("   v1 content: {:?}", first.content);

    println!("\n=== Example Complete ===");
    Ok(())
}
