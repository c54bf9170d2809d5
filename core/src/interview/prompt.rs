use serde::{Deserialize, Serialize};

/// Turn goals advance in this fixed order; the turn loop is the only
/// thing that knows the sequence, `build_prompt` just renders whichever goal
/// it is given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TurnGoal {
    OpenAndAskOneFocusedQuestion,
    ClarifyObjective,
    ClarifyAvailability,
    DecideAndClose,
    NotifyUser,
}

impl TurnGoal {
    pub fn next(self) -> Option<Self> {
        match self {
            Self::OpenAndAskOneFocusedQuestion => Some(Self::ClarifyObjective),
            Self::ClarifyObjective => Some(Self::ClarifyAvailability),
            Self::ClarifyAvailability => Some(Self::DecideAndClose),
            Self::DecideAndClose => Some(Self::NotifyUser),
            Self::NotifyUser => None,
        }
    }

    fn instruction(self) -> &'static str {
        match self {
            Self::OpenAndAskOneFocusedQuestion => {
                "Open the conversation and ask exactly one focused question relevant to the shared objective."
            }
            Self::ClarifyObjective => "Clarify what the other party is actually looking for right now.",
            Self::ClarifyAvailability => "Clarify availability: whether now is a good time to meet.",
            Self::DecideAndClose => {
                "Decide whether this is worth a real-world introduction and say so plainly, then close the turn."
            }
            Self::NotifyUser => {
                "Write the push-notification text that will be shown to the user if a connection is worth making."
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProfileSnapshot {
    pub user_id: uuid::Uuid,
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CircleSnapshot {
    pub objective: String,
    pub radius_meters: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct InterviewContext {
    pub approximate_distance_m: f64,
    pub speaker: &'static str,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptTurn {
    pub speaker: String,
    pub goal: TurnGoal,
    pub text: String,
}

/// Pure prompt assembly: no I/O, no mutation, fully unit-testable without a
/// live `TextGenerator`.
pub fn build_prompt(
    owner: &ProfileSnapshot,
    visitor: &ProfileSnapshot,
    circle: &CircleSnapshot,
    context: &InterviewContext,
    transcript: &[TranscriptTurn],
    goal: TurnGoal,
) -> String {
    let mut prompt = String::new();
    prompt.push_str(&format!(
        "You are facilitating an introduction between {} and {} around the objective \"{}\" (circle radius {}m, approximate distance apart {}m).\n",
        owner.display_name, visitor.display_name, circle.objective, circle.radius_meters, context.approximate_distance_m,
    ));
    prompt.push_str(&format!("You are speaking as: {}\n", context.speaker));
    prompt.push_str(&format!("Turn goal: {}\n", goal.instruction()));

    if !transcript.is_empty() {
        prompt.push_str("Conversation so far:\n");
        for turn in transcript {
            prompt.push_str(&format!("- {}: {}\n", turn.speaker, turn.text));
        }
    }

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_profile(name: &str) -> ProfileSnapshot {
        ProfileSnapshot {
            user_id: uuid::Uuid::new_v4(),
            display_name: name.to_string(),
        }
    }

    #[test]
    fn turn_goals_advance_in_the_documented_order() {
        let mut goal = TurnGoal::OpenAndAskOneFocusedQuestion;
        let mut seen = vec![goal];
        while let Some(next) = goal.next() {
            seen.push(next);
            goal = next;
        }
        assert_eq!(
            seen,
            vec![
                TurnGoal::OpenAndAskOneFocusedQuestion,
                TurnGoal::ClarifyObjective,
                TurnGoal::ClarifyAvailability,
                TurnGoal::DecideAndClose,
                TurnGoal::NotifyUser,
            ]
        );
    }

    #[test]
    fn prompt_includes_objective_and_goal_instruction() {
        let owner = sample_profile("Alex");
        let visitor = sample_profile("Sam");
        let circle = CircleSnapshot {
            objective: "coffee".into(),
            radius_meters: 500.0,
        };
        let context = InterviewContext {
            approximate_distance_m: 80.0,
            speaker: "owner",
        };

        let prompt = build_prompt(&owner, &visitor, &circle, &context, &[], TurnGoal::ClarifyObjective);
        assert!(prompt.contains("coffee"));
        assert!(prompt.contains("Clarify what the other party"));
    }

    #[test]
    fn prompt_renders_prior_transcript_turns() {
        let owner = sample_profile("Alex");
        let visitor = sample_profile("Sam");
        let circle = CircleSnapshot {
            objective: "coffee".into(),
            radius_meters: 500.0,
        };
        let context = InterviewContext {
            approximate_distance_m: 80.0,
            speaker: "visitor",
        };
        let transcript = vec![TranscriptTurn {
            speaker: "owner".into(),
            goal: TurnGoal::OpenAndAskOneFocusedQuestion,
            text: "Are you free this week?".into(),
        }];

        let prompt = build_prompt(&owner, &visitor, &circle, &context, &transcript, TurnGoal::ClarifyAvailability);
        assert!(prompt.contains("Are you free this week?"));
    }
}
