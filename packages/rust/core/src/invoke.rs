//! The inner retry layer around a single generation call.

use tracing::debug;

use crate::classify::Classifier;
use crate::generate::{GenerationRequest, Generator};
use crate::retry::{RetryFailure, RetryPolicy};

/// Calls a [`Generator`] under the transport retry policy.
pub struct Invoker<'a, G> {
    generator: &'a G,
    classifier: &'a Classifier,
    policy: RetryPolicy,
}

impl<'a, G: Generator> Invoker<'a, G> {
    pub fn new(generator: &'a G, classifier: &'a Classifier, policy: RetryPolicy) -> Self {
        Self {
            generator,
            classifier,
            policy,
        }
    }

    /// Return the raw response text, or the last failure once the policy
    /// gives up.
    pub async fn invoke(&self, request: &GenerationRequest) -> Result<String, RetryFailure> {
        let generator = self.generator;
        let total = self.policy.attempts();
        self.policy
            .run(self.classifier, "transport", move |attempt| {
                debug!(attempt = attempt + 1, of = total, model = %request.model, "generation call");
                generator.generate(request)
            })
            .await
    }
}
