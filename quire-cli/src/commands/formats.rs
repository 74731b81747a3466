//! Formats command implementation

use anyhow::Result;
use quire_core::Pipeline;
use serde::Serialize;

#[derive(Serialize)]
struct Codec {
    name: &'static str,
    extensions: Vec<&'static str>,
}

#[derive(Serialize)]
struct Transform {
    name: &'static str,
    description: &'static str,
}

#[derive(Serialize)]
struct Formats {
    inputs: Vec<Codec>,
    outputs: Vec<Codec>,
    transforms: Vec<Transform>,
}

/// List the registered codecs and transforms
pub fn formats(pipeline: &Pipeline, json: bool) -> Result<()> {
    let ctx = pipeline.context();
    let formats = Formats {
        inputs: ctx
            .decoders
            .iter()
            .map(|d| Codec {
                name: d.name(),
                extensions: d.supported_extensions().to_vec(),
            })
            .collect(),
        outputs: ctx
            .encoders
            .iter()
            .map(|e| Codec {
                name: e.name(),
                extensions: e.supported_extensions().to_vec(),
            })
            .collect(),
        transforms: ctx
            .transforms
            .iter()
            .map(|t| Transform {
                name: t.name(),
                description: t.description(),
            })
            .collect(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&formats)?);
        return Ok(());
    }

    println!("Input formats:");
    for codec in &formats.inputs {
        println!("  {:<8} {}", codec.name, codec.extensions.join(", "));
    }
    println!("Output formats:");
    for codec in &formats.outputs {
        println!("  {:<8} {}", codec.name, codec.extensions.join(", "));
    }
    println!("Transforms (in order):");
    for t in &formats.transforms {
        println!("  {:<20} {}", t.name, t.description);
    }
    Ok(())
}
