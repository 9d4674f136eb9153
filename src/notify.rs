/// Typed replacement for ad hoc "something changed, refresh" broadcasts.
/// Mutating handlers record the collections they touched; the router drains
/// the log into the response so the UI can refetch exactly what moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    Classes,
    Quizzes,
    Students,
    Assignments,
    Submissions,
    ArchivedClasses,
    ArchivedQuizzes,
}

impl Topic {
    pub fn as_str(self) -> &'static str {
        match self {
            Topic::Classes => "classes",
            Topic::Quizzes => "quizzes",
            Topic::Students => "students",
            Topic::Assignments => "assignments",
            Topic::Submissions => "submissions",
            Topic::ArchivedClasses => "archivedClasses",
            Topic::ArchivedQuizzes => "archivedQuizzes",
        }
    }
}

#[derive(Debug, Default)]
pub struct ChangeLog {
    topics: Vec<Topic>,
}

impl ChangeLog {
    pub fn record(&mut self, topic: Topic) {
        if !self.topics.contains(&topic) {
            self.topics.push(topic);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    pub fn drain(&mut self) -> Vec<Topic> {
        std::mem::take(&mut self.topics)
    }
}
