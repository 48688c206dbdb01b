use crate::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An installed code bundle. Only the `endoZipBase64` format is accepted by
/// the kernel; other formats round-trip through the store untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
    pub module_format: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endo_zip_base64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endo_zip_base64_sha512: Option<String>,
}

impl Bundle {
    pub const ENDO_ZIP_BASE64: &'static str = "endoZipBase64";

    pub fn endo_zip(zip_base64: impl Into<String>, sha512: impl Into<String>) -> Self {
        Self {
            module_format: Self::ENDO_ZIP_BASE64.into(),
            endo_zip_base64: Some(zip_base64.into()),
            endo_zip_base64_sha512: Some(sha512.into()),
        }
    }
}

pub trait BundleStore {
    fn add_bundle(&mut self, bundle_id: &str, bundle: Bundle) -> StoreResult<()>;
    fn has_bundle(&self, bundle_id: &str) -> StoreResult<bool>;
    fn get_bundle(&self, bundle_id: &str) -> StoreResult<Option<Bundle>>;
    fn delete_bundle(&mut self, bundle_id: &str) -> StoreResult<()>;
}

#[derive(Debug, Clone, Default)]
pub struct MemBundleStore {
    bundles: BTreeMap<String, Bundle>,
}

impl MemBundleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BundleStore for MemBundleStore {
    fn add_bundle(&mut self, bundle_id: &str, bundle: Bundle) -> StoreResult<()> {
        if self.bundles.contains_key(bundle_id) {
            return Err(StoreError::DuplicateBundle(bundle_id.to_owned()));
        }
        self.bundles.insert(bundle_id.to_owned(), bundle);
        Ok(())
    }

    fn has_bundle(&self, bundle_id: &str) -> StoreResult<bool> {
        Ok(self.bundles.contains_key(bundle_id))
    }

    fn get_bundle(&self, bundle_id: &str) -> StoreResult<Option<Bundle>> {
        Ok(self.bundles.get(bundle_id).cloned())
    }

    fn delete_bundle(&mut self, bundle_id: &str) -> StoreResult<()> {
        self.bundles.remove(bundle_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_bundles_are_rejected() {
        let mut store = MemBundleStore::new();
        let bundle = Bundle::endo_zip("UEsDBA==", "abc");
        store.add_bundle("b1-00", bundle.clone()).unwrap();
        assert!(store.has_bundle("b1-00").unwrap());
        assert!(matches!(
            store.add_bundle("b1-00", bundle.clone()),
            Err(StoreError::DuplicateBundle(_))
        ));
        assert_eq!(store.get_bundle("b1-00").unwrap(), Some(bundle));
        store.delete_bundle("b1-00").unwrap();
        assert!(!store.has_bundle("b1-00").unwrap());
    }

    #[test]
    fn bundle_json_uses_camel_case() {
        let bundle = Bundle::endo_zip("zip", "sha");
        let json = serde_json::to_value(&bundle).unwrap();
        assert_eq!(json["moduleFormat"], "endoZipBase64");
        assert_eq!(json["endoZipBase64Sha512"], "sha");
    }
}
