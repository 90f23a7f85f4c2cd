//! Fuzz target for catalog model ingestion.
//!
//! Arbitrary bytes are parsed as a model document. Whatever parses must
//! survive validation, node enumeration, digesting and planning against
//! an empty destination without panicking.

#![no_main]

use catalog_replication::diff::{DiffOptions, ModelDiffer};
use catalog_replication::model::Configurable;
use catalog_replication::CatalogModel;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(model) = serde_json::from_slice::<CatalogModel>(data) else {
        return;
    };

    // Errors are fine, panics are not.
    let valid = model.validate().is_ok();

    for node in model.nodes() {
        let _ = model.node(&node.path());
        let _ = node.config();
    }

    // Digest is a pure function of the model.
    if let (Ok(a), Ok(b)) = (model.digest(), model.clone().digest()) {
        assert_eq!(a, b);
    }

    if valid {
        let _ = ModelDiffer::new(DiffOptions::default()).plan(&model, &CatalogModel::default());
    }
});
