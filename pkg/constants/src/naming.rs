//! Naming constants shared by the resource types and the controllers.

/// Prefix of every role and policy name created on the IAM side.
pub const AWS_NAME_PREFIX: &str = "irsa-op";

/// Root of the IAM path under which policies are created.
pub const AWS_PATH_ROOT: &str = "/irsa-op/";

/// IAM hard limit on role and policy names.
pub const AWS_NAME_MAX_LEN: usize = 64;

/// Kubernetes-style limit on object names.
pub const OBJECT_NAME_MAX_LEN: usize = 63;

/// Annotation read by the workload identity webhook.
pub const ROLE_ARN_ANNOTATION: &str = "eks.amazonaws.com/role-arn";

/// Finalizer owned by the IamRoleServiceAccount controller.
pub const IRSA_FINALIZER: &str = "irsa.irsa.voodoo.io";

/// Finalizer owned by the Policy controller.
pub const POLICY_FINALIZER: &str = "policy.irsa.voodoo.io";

/// Finalizer owned by the Role controller.
pub const ROLE_FINALIZER: &str = "role.irsa.voodoo.io";
