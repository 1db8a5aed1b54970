use kube::{Resource, ResourceExt};

use crate::{Error, Result};

/// Makes `owner` the controller of `dependent`.
///
/// The reference sets `controller` and `blockOwnerDeletion`, so garbage
/// collection removes the dependent together with its owner. An existing
/// reference to the same owner is replaced; other non-controller references
/// are kept.
pub fn set_controller_owner<O, D>(owner: &O, dependent: &mut D) -> Result<()>
where
    O: Resource<DynamicType = ()>,
    D: Resource,
{
    let owner_ref = owner.controller_owner_ref(&()).ok_or_else(|| {
        Error::Validation(format!(
            "{} {} has no uid and cannot own other objects",
            O::kind(&()),
            owner.name_any()
        ))
    })?;

    let refs = dependent.meta_mut().owner_references.get_or_insert_with(Vec::new);
    if let Some(existing) = refs
        .iter()
        .find(|r| r.controller == Some(true) && r.uid != owner_ref.uid)
    {
        return Err(Error::AlreadyOwned(format!("{} {}", existing.kind, existing.name)));
    }

    refs.retain(|r| r.uid != owner_ref.uid);
    refs.push(owner_ref);
    Ok(())
}
