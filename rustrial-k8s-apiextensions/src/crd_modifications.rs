use crate::{crd_registry::CrdClient, errors::ControllerError};
use json_patch::diff;
use kube::ResourceExt;
use rustrial_k8s_apiextensions_apis::CustomResourceDefinition;
use std::ops::DerefMut;

/// Helper construct to simplify status updates of [`CustomResourceDefinition`] objects.
pub(crate) struct CrdModifications {
    original: CustomResourceDefinition,
    pub modified: CustomResourceDefinition,
}

impl std::ops::Deref for CrdModifications {
    type Target = CustomResourceDefinition;

    fn deref(&self) -> &Self::Target {
        &self.modified
    }
}

impl DerefMut for CrdModifications {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.modified
    }
}

impl CrdModifications {
    pub(crate) fn new(original: CustomResourceDefinition) -> Self {
        let modified = original.clone();
        Self { original, modified }
    }

    pub(crate) fn into_inner(self) -> CustomResourceDefinition {
        self.modified
    }

    fn get_status_patch(&self) -> Result<Option<json_patch::Patch>, ControllerError> {
        let patch = diff(
            &serde_json::to_value(&self.original.status)?,
            &serde_json::to_value(&self.modified.status)?,
        );
        if patch.0.is_empty() {
            Ok(None)
        } else {
            Ok(Some(patch))
        }
    }

    pub(crate) fn status_has_changed(&self) -> Result<bool, ControllerError> {
        Ok(self.get_status_patch()?.is_some()
            || self.original.finalizers() != self.modified.finalizers())
    }

    /// Writes status and finalizers through the status subresource if they
    /// changed, returns whether a write happened.
    pub(crate) async fn update_status(
        &mut self,
        client: &dyn CrdClient,
    ) -> Result<bool, ControllerError> {
        if !self.status_has_changed()? {
            return Ok(false);
        }
        if let Some(patch) = self.get_status_patch()? {
            debug!(
                "Update status of {} ({:?}) with {}",
                self.original.name_any(),
                self.original.resource_version(),
                serde_json::to_string(&patch)?
            );
        }
        let updated = client.update_status(&self.modified).await?;
        self.original = updated.clone();
        self.modified = updated;
        Ok(true)
    }
}
